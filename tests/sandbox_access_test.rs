#[cfg(test)]
mod tests {
    use cofs::{FileAccess, FileRef, SandboxFs, StreamConfig};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn access(temp: &TempDir, quota: Option<u64>) -> FileAccess<SandboxFs> {
        let mut backend = SandboxFs::new(temp.path());
        if let Some(quota) = quota {
            backend = backend.with_quota(quota);
        }
        FileAccess::new(Arc::new(backend)).with_config(StreamConfig::new().with_block_size(64))
    }

    #[tokio::test]
    async fn test_write_read_and_copy_on_disk() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let access = access(&temp, None);
        let content: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let written = access.write_file("in/source.bin", content.clone()).await?;
        assert_eq!(written, 1000);
        assert_eq!(fs::read(temp.path().join("in/source.bin"))?, content);

        let read = access.read_file(FileRef::path("in/source.bin")).await?;
        assert_eq!(&read[..], &content[..]);

        let copied = access
            .copy(FileRef::path("in/source.bin"), "out/copy.bin", |_| {})
            .await?;
        assert_eq!(copied, 1000);
        assert_eq!(fs::read(temp.path().join("out/copy.bin"))?, content);

        let info = access.stat("out/copy.bin").await?;
        assert_eq!(info.size, 1000);
        assert_eq!(info.path, "/out/copy.bin");
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_range_read_on_disk() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        fs::write(temp.path().join("alpha.txt"), "abcdefghijklmnopqrstuvwxyz")?;
        let access = access(&temp, None);

        let stream = access.create_read_stream(
            FileRef::path("alpha.txt"),
            StreamConfig::new().with_block_size(5).with_start(3).with_end(9),
        )?;
        let chunks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        cofs::Publisher::on(&stream, cofs::EventKind::Data, move |event| {
            if let cofs::StreamEvent::Data(data) = event {
                sink.lock().unwrap().push(data.clone());
            }
        });

        assert_eq!(stream.start().await?, cofs::ReadOutcome::Finished);
        let chunks = chunks.lock().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], b"defgh");
        assert_eq!(&chunks[1][..], b"i");
        Ok(())
    }

    #[tokio::test]
    async fn test_quota_stops_write_with_backend_error() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let access = access(&temp, Some(10));

        let err = access
            .write_file("big.bin", vec![0u8; 11])
            .await
            .unwrap_err();
        assert!(err.is_backend());
        assert!(err.to_string().contains("Quota exceeded"));

        // The target was primed before the failing append.
        assert_eq!(fs::metadata(temp.path().join("big.bin"))?.len(), 0);
        assert_eq!(access.backend().used_bytes(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_paths_outside_root_are_rejected() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let access = access(&temp, None);

        let err = access.write_file("../escape.txt", "x").await.unwrap_err();
        assert!(err.is_backend());
        assert!(!temp.path().parent().unwrap().join("escape.txt").exists());

        assert!(access.stat("../etc/passwd").await.is_err());
        Ok(())
    }
}
