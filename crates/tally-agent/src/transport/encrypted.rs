use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tally_common::crypto::Encryptor;
use tally_common::sign::Signer;
use tally_common::types::Snapshot;

use super::{dispatch, for_each_metric, HttpTarget, Transport};

/// Per-metric JSON sealed with the server's public key, sent to
/// `POST /update_enc`.
pub struct EncryptedTransport {
    target: HttpTarget,
    encryptor: Encryptor,
    signer: Option<Signer>,
}

impl EncryptedTransport {
    pub fn new(target: HttpTarget, encryptor: Encryptor, signer: Option<Signer>) -> Self {
        Self {
            target,
            encryptor,
            signer,
        }
    }
}

#[async_trait]
impl Transport for EncryptedTransport {
    fn name(&self) -> &'static str {
        "encrypted"
    }

    async fn send(&self, snapshot: &Snapshot) -> Result<()> {
        for_each_metric(self.name(), snapshot, |mut metric| async move {
            if let Some(signer) = &self.signer {
                signer.sign_in_place(&mut metric);
            }
            let plaintext = serde_json::to_vec(&metric)?;
            let sealed = self.encryptor.encrypt(&plaintext)?;
            let request = self
                .target
                .post(&["update_enc"])?
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(sealed);
            dispatch(request).await
        })
        .await
    }
}
