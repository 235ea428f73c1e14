//! File storage for captured downloads: one directory per board below the
//! configured root.

use cifx::types::BoardInformation;
use cifx::{ApiError, ApiResult, DownloadMode, FileStorage};
use marshaller::logging;
use std::fs;
use std::path::PathBuf;

pub struct DiskStorage {
    root: PathBuf,
    log: logging::Logger,
}

impl DiskStorage {
    pub fn new<P: Into<PathBuf>>(root: P, log: &logging::Logger) -> DiskStorage {
        DiskStorage {
            root: root.into(),
            log: log.new(logging::o!()),
        }
    }
}

impl FileStorage for DiskStorage {
    fn store(
        &self,
        board: &BoardInformation,
        file_name: &str,
        data: &[u8],
        channel: u32,
        mode: DownloadMode,
    ) -> ApiResult<()> {
        // The client controls the name; keep only its final component.
        let base = file_name
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or(file_name);

        let mut path = self.root.join(&board.name);
        if let Err(err) = fs::create_dir_all(&path) {
            logging::warn!(self.log, "creating download directory failed";
                           "path" => %path.display(), "error" => %err);
            return Err(ApiError::FILE_STORE_FAILED);
        }
        path.push(base);

        match fs::write(&path, data) {
            Ok(()) => {
                logging::info!(self.log, "download stored";
                               "path" => %path.display(),
                               "bytes" => data.len(),
                               "channel" => channel,
                               "mode" => ?mode);
                Ok(())
            }
            Err(err) => {
                logging::warn!(self.log, "writing download failed";
                               "path" => %path.display(), "error" => %err);
                Err(ApiError::FILE_STORE_FAILED)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_store_writes_below_board_directory() {
        let root = env::temp_dir().join("gateway-storage-test");
        let _ = fs::remove_dir_all(&root);

        let storage = DiskStorage::new(&root, &logging::child_or_discard(None));
        let board = BoardInformation {
            name: "cifX0".into(),
            ..BoardInformation::default()
        };

        storage
            .store(&board, "../BOOT.NXF", &[1, 2, 3], 0, DownloadMode::Firmware)
            .unwrap();

        let written = fs::read(root.join("cifX0").join("BOOT.NXF")).unwrap();
        assert_eq!(written, vec![1, 2, 3]);

        let _ = fs::remove_dir_all(&root);
    }
}
