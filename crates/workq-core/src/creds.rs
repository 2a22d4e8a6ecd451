// Derivation of short-lived work credentials
//
// A successful claim hands the worker credentials scoped to the task's
// declared scopes plus the run-management scopes for that specific run,
// expiring at the claim's taken_until. Derivation is pure: access token and
// certificate signature are computed from the root credentials, never
// minted by a remote service.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Long-lived credentials the claimer derives from
#[derive(Debug, Clone)]
pub struct RootCredentials {
    pub client_id: String,
    pub access_token: String,
}

/// Scoped, time-bounded credentials for one claimed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkCredentials {
    pub client_id: String,
    pub access_token: String,
    /// Base64-encoded JSON certificate carrying scopes, validity window,
    /// seed and signature
    pub certificate: String,
    pub expiry: DateTime<Utc>,
}

/// Derive credentials for a claimed run.
///
/// Scopes granted: the run-management scopes for `(task_id, run_id)` plus
/// every scope the task declares.
///
/// `expiry` is the taken_until stored on the run, so a retried claim gets
/// fresh tokens over the original window rather than an extended one.
#[allow(clippy::too_many_arguments)]
pub fn derive_task_credentials(
    task_id: Uuid,
    run_id: u32,
    worker_group: &str,
    worker_id: &str,
    expiry: DateTime<Utc>,
    scopes: &[String],
    root: &RootCredentials,
) -> WorkCredentials {
    let start = Utc::now();

    let mut seed_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut seed_bytes);
    let seed = hex::encode(seed_bytes);

    let mut granted = vec![
        format!("queue:reclaim-task:{task_id}/{run_id}"),
        format!("queue:resolve-task:{task_id}/{run_id}"),
        format!("queue:worker-id:{worker_group}/{worker_id}"),
    ];
    granted.extend(scopes.iter().cloned());

    // Temporary access token: HMAC-style digest of root token and seed
    let mut hasher = Sha256::new();
    hasher.update(root.access_token.as_bytes());
    hasher.update(seed.as_bytes());
    let access_token = URL_SAFE_NO_PAD.encode(hasher.finalize());

    // Signature binds issuer, validity window, seed and scopes together
    let mut signer = Sha256::new();
    signer.update(root.access_token.as_bytes());
    signer.update(format!("version:1\nissuer:{}\n", root.client_id).as_bytes());
    signer.update(format!("seed:{seed}\n").as_bytes());
    signer.update(
        format!(
            "start:{}\nexpiry:{}\n",
            start.timestamp_millis(),
            expiry.timestamp_millis()
        )
        .as_bytes(),
    );
    signer.update(b"scopes:\n");
    for scope in &granted {
        signer.update(scope.as_bytes());
        signer.update(b"\n");
    }
    let signature = STANDARD.encode(signer.finalize());

    let certificate = serde_json::json!({
        "version": 1,
        "issuer": root.client_id,
        "scopes": granted,
        "start": start.timestamp_millis(),
        "expiry": expiry.timestamp_millis(),
        "seed": seed,
        "signature": signature,
    });

    WorkCredentials {
        client_id: format!("run-{task_id}-{run_id}-on-{worker_group}-{worker_id}"),
        access_token,
        certificate: STANDARD.encode(certificate.to_string()),
        expiry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn root() -> RootCredentials {
        RootCredentials {
            client_id: "queue-root".to_string(),
            access_token: "hunter2".to_string(),
        }
    }

    fn decode_certificate(creds: &WorkCredentials) -> serde_json::Value {
        let raw = STANDARD.decode(&creds.certificate).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    #[test]
    fn test_credentials_embed_task_scopes_and_expiry() {
        let task_id = Uuid::now_v7();
        let expiry = Utc::now() + Duration::seconds(1200);
        let scopes = vec!["secrets:get:project/thing".to_string()];

        let creds = derive_task_credentials(task_id, 0, "g1", "w1", expiry, &scopes, &root());

        assert_eq!(creds.expiry, expiry);
        assert!(creds.client_id.contains("w1"));

        let cert = decode_certificate(&creds);
        assert_eq!(cert["issuer"], "queue-root");
        assert_eq!(cert["expiry"], expiry.timestamp_millis());
        let granted: Vec<String> =
            serde_json::from_value(cert["scopes"].clone()).unwrap();
        assert!(granted.contains(&"secrets:get:project/thing".to_string()));
        assert!(granted.contains(&format!("queue:reclaim-task:{task_id}/0")));
    }

    #[test]
    fn test_access_token_never_reveals_root_token() {
        let creds = derive_task_credentials(
            Uuid::now_v7(),
            0,
            "g1",
            "w1",
            Utc::now(),
            &[],
            &root(),
        );
        assert!(!creds.access_token.contains("hunter2"));
        assert!(!creds.certificate.contains("hunter2"));
    }

    #[test]
    fn test_seed_makes_tokens_unique() {
        let task_id = Uuid::now_v7();
        let expiry = Utc::now();
        let a = derive_task_credentials(task_id, 0, "g1", "w1", expiry, &[], &root());
        let b = derive_task_credentials(task_id, 0, "g1", "w1", expiry, &[], &root());
        assert_ne!(a.access_token, b.access_token);
    }
}
