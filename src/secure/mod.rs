//! Leader certificate handling.
//!
//! The certificate is the node secret of the staking identity. The
//! supervisor never interprets it; it only re-posts it to whichever node
//! is being promoted, so it is parsed just far enough to be re-encoded as
//! JSON for the REST interface.

use serde_json::Value;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("cannot read the leader certificate")]
    Io(#[from] std::io::Error),
    #[error("invalid leader certificate file")]
    Format(#[from] serde_yaml::Error),
}

#[derive(Clone)]
pub struct LeaderCertificate {
    secret: Value,
}

impl LeaderCertificate {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CertificateError> {
        let file = std::fs::File::open(path)?;
        let secret = serde_yaml::from_reader(file)?;
        Ok(LeaderCertificate { secret })
    }

    pub fn secret(&self) -> &Value {
        &self.secret
    }

    #[cfg(test)]
    pub fn dummy() -> Self {
        LeaderCertificate {
            secret: serde_json::json!({"bft": {"signing_key": "ed25519_sk_test"}}),
        }
    }
}

impl fmt::Debug for LeaderCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never leak the secret into logs
        f.write_str("LeaderCertificate(..)")
    }
}
