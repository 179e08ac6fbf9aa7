//! Outbox collaborators for the runner: a plain-text remittance composer
//! and a transport that drops files into a local directory tree.

use remit_core::{
    collaborators::{
        ComposeError, ComposedFile, DeliveryRequest, DeliveryTransport, FileComposer, TransportError,
    },
    model::{Bucket, ClaimLogEntry},
    types::Money,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Pipe-delimited summary: a header, one line per claim, a trailer with
/// the count and total. Stands in for the real remittance encoder.
#[derive(Debug, Clone, Default)]
pub struct OutboxComposer;

impl FileComposer for OutboxComposer {
    fn compose(&self, bucket: &Bucket, claims: &[ClaimLogEntry]) -> Result<ComposedFile, ComposeError> {
        if claims.is_empty() {
            return Err(ComposeError(format!("bucket {} has no claims", bucket.bucket_id)));
        }
        let mut total = Money::ZERO;
        let mut lines = vec![format!(
            "HDR|{}|{}|{}",
            bucket.bucket_id, bucket.payer_id, bucket.payee_id
        )];
        for claim in claims {
            let amount = claim
                .amount
                .ok_or_else(|| ComposeError(format!("claim {} has no amount", claim.claim_id)))?;
            total = total
                .checked_add(amount)
                .ok_or_else(|| ComposeError("remittance total overflows".into()))?;
            lines.push(format!("CLP|{}|{}", claim.claim_id, amount));
        }
        lines.push(format!("TRL|{}|{}", claims.len(), total));

        Ok(ComposedFile {
            file_name: format!("{}.txt", bucket.bucket_id),
            destination: bucket.payee_id.clone(),
            content: (lines.join("\n") + "\n").into_bytes(),
        })
    }
}

/// Writes each upload to `{root}/{destination}/{file_name}`.
#[derive(Debug, Clone)]
pub struct DirectoryTransport {
    root: PathBuf,
}

impl DirectoryTransport {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl DeliveryTransport for DirectoryTransport {
    fn upload(&self, request: &DeliveryRequest<'_>) -> Result<(), TransportError> {
        if request.destination.contains("..")
            || Path::new(request.destination).is_absolute()
            || request.file_name.contains('/')
            || request.file_name.contains("..")
        {
            return Err(TransportError::Rejected(format!(
                "unsafe path {}/{}",
                request.destination, request.file_name
            )));
        }
        let dir = self.root.join(request.destination);
        fs::create_dir_all(&dir)
            .map_err(|e| TransportError::Connection(format!("{}: {e}", dir.display())))?;
        let path = dir.join(request.file_name);
        fs::write(&path, request.content)
            .map_err(|e| TransportError::Connection(format!("{}: {e}", path.display())))?;
        log::debug!("outbox: wrote {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!("remit-outbox-{tag}-{}-{nanos}", std::process::id()))
    }

    fn request<'a>(destination: &'a str, file_name: &'a str) -> DeliveryRequest<'a> {
        DeliveryRequest {
            file_name,
            destination,
            content: b"HDR|b-1|P|E\n",
        }
    }

    #[test]
    fn writes_under_the_outbox_root() {
        let root = scratch_dir("write");
        let transport = DirectoryTransport::new(&root);
        transport.upload(&request("RX-0001", "b-1.txt")).unwrap();

        let written = fs::read(root.join("RX-0001").join("b-1.txt")).unwrap();
        assert_eq!(written, b"HDR|b-1|P|E\n");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn destinations_cannot_leave_the_outbox_root() {
        let root = scratch_dir("escape");
        let transport = DirectoryTransport::new(&root);
        for (destination, file_name) in [
            ("/tmp", "b-1.txt"),
            ("../elsewhere", "b-1.txt"),
            ("RX-0001", "../b-1.txt"),
            ("RX-0001", "nested/b-1.txt"),
        ] {
            let err = transport.upload(&request(destination, file_name)).unwrap_err();
            assert!(
                matches!(err, TransportError::Rejected(_)),
                "{destination}/{file_name} should be rejected"
            );
        }
        assert!(!root.exists());
    }
}
