//! Chunked stop-and-wait file transfer.
//!
//! The sender keeps one chunk sealed ahead of the peer's acknowledgements so
//! the next chunk can go out as soon as an ACK arrives. Because that chunk
//! already consumed a record counter, every other outbound record of the
//! session waits in `deferred` until the chunk is written.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use murmur_shared::protocol::{FileInfo, Message};

use crate::error::TransferError;
use crate::events::AskPath;
use crate::record::{SealedRecord, SendCipher};

/// Progress of one file after a chunk was acknowledged or written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    pub file_index: usize,
    pub file_name: String,
    pub transferred: u64,
    pub size: u64,
}

/// What the manager has to do after a transfer state change.
#[derive(Debug, Default)]
pub struct Step {
    /// Sealed records to write, in order.
    pub outbound: Vec<Vec<u8>>,
    pub progress: Vec<FileProgress>,
    pub finished: bool,
    /// Set when the transfer cannot go on. `outbound` still has to be written.
    pub failed: Option<TransferError>,
}

/// Name shown to the peer for a local path.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

struct OutgoingFile {
    info: FileInfo,
    source: Option<File>,
    read: u64,
    transferred: u64,
}

pub struct FilesSender {
    files: Vec<OutgoingFile>,
    index: usize,
    prefetched: Option<SealedRecord>,
    /// Sizes of sealed chunks not yet acknowledged, oldest first.
    in_flight: VecDeque<usize>,
    /// Encoded messages waiting for the prefetched chunk to be written.
    deferred: VecDeque<Vec<u8>>,
    chunk_size: usize,
    accepted: bool,
}

impl FilesSender {
    /// Open every file of the batch up front so an unreadable file fails the request.
    pub async fn open(paths: &[PathBuf], chunk_size: usize) -> Result<Self, TransferError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let unreadable = |e: std::io::Error| {
                TransferError::Unreadable(format!("{}: {e}", path.display()))
            };
            let source = File::open(path).await.map_err(unreadable)?;
            let size = source.metadata().await.map_err(unreadable)?.len();
            files.push(OutgoingFile {
                info: FileInfo {
                    name: display_name(path),
                    size,
                },
                source: Some(source),
                read: 0,
                transferred: 0,
            });
        }

        Ok(Self {
            files,
            index: 0,
            prefetched: None,
            in_flight: VecDeque::new(),
            deferred: VecDeque::new(),
            chunk_size: chunk_size.max(1),
            accepted: false,
        })
    }

    pub fn files(&self) -> Vec<FileInfo> {
        self.files.iter().map(|f| f.info.clone()).collect()
    }

    pub fn ask_message(&self) -> Message {
        Message::AskLargeFiles(self.files())
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// While true, nothing else may be sealed for this session.
    pub fn is_prefetching(&self) -> bool {
        self.prefetched.is_some()
    }

    pub fn defer(&mut self, payload: Vec<u8>) {
        self.deferred.push_back(payload);
    }

    async fn prefetch(
        &mut self,
        cipher: &mut SendCipher,
    ) -> Result<Option<SealedRecord>, TransferError> {
        let chunk_size = self.chunk_size as u64;
        let Some(file) = self.files.get_mut(self.index) else {
            return Ok(None);
        };
        let remaining = file.info.size.saturating_sub(file.read);
        if remaining == 0 {
            return Ok(None);
        }
        let Some(source) = file.source.as_mut() else {
            return Err(TransferError::Unreadable(format!(
                "{}: already closed",
                file.info.name
            )));
        };

        let want = remaining.min(chunk_size);
        let mut chunk = Vec::with_capacity(want as usize);
        AsyncReadExt::take(&mut *source, want)
            .read_to_end(&mut chunk)
            .await
            .map_err(|e| TransferError::Unreadable(format!("{}: {e}", file.info.name)))?;
        if chunk.is_empty() {
            return Err(TransferError::Unreadable(format!(
                "{}: file is shorter than announced",
                file.info.name
            )));
        }
        file.read += chunk.len() as u64;

        let len = chunk.len();
        let payload = Message::LargeFileChunk(chunk)
            .encode()
            .map_err(|e| TransferError::Sealing(e.to_string()))?;
        let record = cipher
            .seal(&payload)
            .map_err(|e| TransferError::Sealing(e.to_string()))?;
        self.in_flight.push_back(len);
        Ok(Some(record))
    }

    fn flush_deferred(
        &mut self,
        cipher: &mut SendCipher,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<(), TransferError> {
        while let Some(payload) = self.deferred.pop_front() {
            let record = cipher
                .seal(&payload)
                .map_err(|e| TransferError::Sealing(e.to_string()))?;
            out.push(record.into_bytes());
        }
        Ok(())
    }

    /// Completes zero-length files, which carry no chunk on the wire.
    fn skip_empty(&mut self, step: &mut Step) {
        while let Some(file) = self.files.get_mut(self.index) {
            if file.info.size != 0 {
                break;
            }
            file.source = None;
            step.progress.push(FileProgress {
                file_index: self.index,
                file_name: file.info.name.clone(),
                transferred: 0,
                size: 0,
            });
            self.index += 1;
        }
    }

    /// Send the first chunk of the current file and keep the next one ready.
    async fn start_file(
        &mut self,
        cipher: &mut SendCipher,
        step: &mut Step,
    ) -> Result<(), TransferError> {
        self.skip_empty(step);
        if self.index >= self.files.len() {
            step.finished = true;
            return Ok(());
        }
        if let Some(first) = self.prefetch(cipher).await? {
            step.outbound.push(first.into_bytes());
            self.prefetched = self.prefetch(cipher).await?;
        }
        Ok(())
    }

    pub async fn on_accept(&mut self, cipher: &mut SendCipher) -> Step {
        let mut step = Step::default();
        if self.accepted {
            warn!("Duplicate ACCEPT_LARGE_FILES ignored");
            return step;
        }
        self.accepted = true;
        if let Err(e) = self.start_file(cipher, &mut step).await {
            step.failed = Some(e);
        }
        step
    }

    pub async fn on_ack(&mut self, cipher: &mut SendCipher) -> Step {
        let mut step = Step::default();
        if let Err(e) = self.advance(cipher, &mut step).await {
            step.failed = Some(e);
        }
        step
    }

    async fn advance(
        &mut self,
        cipher: &mut SendCipher,
        step: &mut Step,
    ) -> Result<(), TransferError> {
        if let Some(chunk) = self.prefetched.take() {
            step.outbound.push(chunk.into_bytes());
        }
        self.flush_deferred(cipher, &mut step.outbound)?;

        let Some(acked) = self.in_flight.pop_front() else {
            warn!("ACK_CHUNK without a chunk in flight");
            return Ok(());
        };
        let index = self.index;
        let Some(file) = self.files.get_mut(index) else {
            return Ok(());
        };
        file.transferred += acked as u64;
        step.progress.push(FileProgress {
            file_index: index,
            file_name: file.info.name.clone(),
            transferred: file.transferred,
            size: file.info.size,
        });

        if file.transferred >= file.info.size {
            file.source = None;
            debug!(file = %file.info.name, "File sent");
            self.index += 1;
            self.start_file(cipher, step).await?;
        } else {
            self.prefetched = self.prefetch(cipher).await?;
        }
        Ok(())
    }

    /// Local cancellation: the prefetched chunk and deferred messages still go out
    /// so the peer's receive counter stays in step. The caller sends ABORT afterwards.
    pub fn cancel(mut self, cipher: &mut SendCipher) -> Result<Vec<Vec<u8>>, TransferError> {
        let mut out = Vec::new();
        if let Some(chunk) = self.prefetched.take() {
            out.push(chunk.into_bytes());
        }
        self.flush_deferred(cipher, &mut out)?;
        Ok(out)
    }

    /// The peer aborted: the prefetched chunk is dropped unsent and its counter reused.
    pub fn abort_by_peer(mut self, cipher: &mut SendCipher) -> Result<Vec<Vec<u8>>, TransferError> {
        let mut out = Vec::new();
        if let Some(chunk) = self.prefetched.take() {
            self.in_flight.pop_back();
            if let Err(unsent) = cipher.rewind(chunk) {
                // something was sealed after the chunk; it has to go out to keep counters aligned
                out.push(unsent.into_bytes());
            }
        }
        self.flush_deferred(cipher, &mut out)?;
        Ok(out)
    }
}

struct IncomingFile {
    info: FileInfo,
    sink: Option<File>,
    path: Option<PathBuf>,
    transferred: u64,
}

pub struct FilesReceiver {
    files: Vec<IncomingFile>,
    index: usize,
    download_dir: PathBuf,
    accepted: bool,
    ask_path: AskPath,
}

impl FilesReceiver {
    pub fn new(files: Vec<FileInfo>, download_dir: PathBuf, ask_path: AskPath) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|info| IncomingFile {
                    info,
                    sink: None,
                    path: None,
                    transferred: 0,
                })
                .collect(),
            index: 0,
            download_dir,
            accepted: false,
            ask_path,
        }
    }

    pub fn files(&self) -> Vec<FileInfo> {
        self.files.iter().map(|f| f.info.clone()).collect()
    }

    pub fn ask_path(&self) -> AskPath {
        self.ask_path
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Where completed (or in-progress) files landed.
    pub fn saved_paths(&self) -> Vec<PathBuf> {
        self.files.iter().filter_map(|f| f.path.clone()).collect()
    }

    /// Open the sink for the current file. Zero-length files are created and completed here.
    async fn open_current(&mut self, step: &mut Step) -> Result<(), TransferError> {
        loop {
            let index = self.index;
            let Some(file) = self.files.get_mut(index) else {
                step.finished = true;
                return Ok(());
            };
            let (path, sink) = create_unique(&self.download_dir, &file.info.name).await?;
            debug!(path = %path.display(), "Receiving file");
            file.path = Some(path);
            if file.info.size > 0 {
                file.sink = Some(sink);
                return Ok(());
            }
            step.progress.push(FileProgress {
                file_index: index,
                file_name: file.info.name.clone(),
                transferred: 0,
                size: 0,
            });
            self.index += 1;
        }
    }

    pub async fn accept(&mut self) -> Result<Step, TransferError> {
        fs::create_dir_all(&self.download_dir).await.map_err(|e| {
            TransferError::Unwritable(format!("{}: {e}", self.download_dir.display()))
        })?;
        self.accepted = true;
        let mut step = Step::default();
        self.open_current(&mut step).await?;
        Ok(step)
    }

    /// Write one chunk. The caller acknowledges it once this returns.
    pub async fn on_chunk(&mut self, chunk: &[u8]) -> Result<Step, TransferError> {
        if !self.accepted {
            return Err(TransferError::NoTransfer);
        }
        let index = self.index;
        let Some(file) = self.files.get_mut(index) else {
            return Err(TransferError::NoTransfer);
        };
        let remaining = file.info.size - file.transferred;
        if chunk.len() as u64 > remaining {
            return Err(TransferError::Unwritable(format!(
                "{}: more data than announced",
                file.info.name
            )));
        }
        let Some(sink) = file.sink.as_mut() else {
            return Err(TransferError::NoTransfer);
        };
        let unwritable = |e: std::io::Error| TransferError::Unwritable(format!("{}: {e}", file.info.name));
        sink.write_all(chunk).await.map_err(unwritable)?;
        file.transferred += chunk.len() as u64;

        let mut step = Step::default();
        step.progress.push(FileProgress {
            file_index: index,
            file_name: file.info.name.clone(),
            transferred: file.transferred,
            size: file.info.size,
        });

        if file.transferred >= file.info.size {
            if let Some(mut sink) = file.sink.take() {
                sink.flush().await.map_err(unwritable)?;
            }
            debug!(file = %file.info.name, "File received");
            self.index += 1;
            self.open_current(&mut step).await?;
        }
        Ok(step)
    }

    /// Close handles and remove the partially written file.
    pub async fn abort(mut self) {
        if let Some(file) = self.files.get_mut(self.index) {
            file.sink = None;
            if let Some(path) = file.path.take() {
                if let Err(e) = fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %e, "Could not remove partial file");
                }
            }
        }
    }
}

/// Create `name` inside `dir` without overwriting anything, adding ` (n)` before the extension.
async fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, File), TransferError> {
    // never let a peer-provided name escape the download directory
    let base = Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("file"));
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = base.extension().map(|e| e.to_string_lossy().into_owned());

    for attempt in 0..1000u32 {
        let candidate = if attempt == 0 {
            dir.join(&base)
        } else {
            match &ext {
                Some(ext) => dir.join(format!("{stem} ({attempt}).{ext}")),
                None => dir.join(format!("{stem} ({attempt})")),
            }
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(TransferError::Unwritable(format!(
                    "{}: {e}",
                    candidate.display()
                )))
            }
        }
    }
    Err(TransferError::Unwritable(format!(
        "{}: no free file name",
        dir.join(&base).display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PaddingPolicy, RecvCipher};
    use murmur_shared::constants::MAX_RECORD_SIZE;
    use murmur_shared::crypto::DirectionKeys;

    fn ciphers() -> (SendCipher, RecvCipher) {
        let keys = DirectionKeys {
            key: [1u8; 32],
            iv: [2u8; 12],
        };
        let policy = PaddingPolicy {
            enabled: false,
            bucket_start: 1000,
        };
        (
            SendCipher::new(keys.clone(), policy),
            RecvCipher::new(keys, MAX_RECORD_SIZE),
        )
    }

    async fn read_message(recv: &mut RecvCipher, bytes: &[u8]) -> Message {
        let mut reader = bytes;
        let payload = recv.read_record(&mut reader).await.unwrap();
        Message::decode(&payload).unwrap()
    }

    fn write_files(dir: &Path, files: &[(&str, Vec<u8>)]) -> Vec<PathBuf> {
        files
            .iter()
            .map(|(name, content)| {
                let path = dir.join(name);
                std::fs::write(&path, content).unwrap();
                path
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_batch_transfer() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let big: Vec<u8> = (0..25u8).collect();
        let small = vec![7u8; 7];
        let paths = write_files(
            src.path(),
            &[("big.bin", big.clone()), ("empty", vec![]), ("small.bin", small.clone())],
        );

        let (mut send_c, mut recv_c) = ciphers();
        let mut sender = FilesSender::open(&paths, 10).await.unwrap();
        assert_eq!(
            sender.files().iter().map(|f| f.size).collect::<Vec<_>>(),
            vec![25, 0, 7]
        );
        let mut receiver = FilesReceiver::new(sender.files(), dst.path().to_path_buf(), AskPath::Prompt);
        assert!(!receiver.accept().await.unwrap().finished);

        let mut wire: VecDeque<Vec<u8>> = sender.on_accept(&mut send_c).await.outbound.into();
        assert!(sender.is_prefetching());

        let mut finished = false;
        let mut chunks = 0;
        while let Some(bytes) = wire.pop_front() {
            let Message::LargeFileChunk(chunk) = read_message(&mut recv_c, &bytes).await else {
                panic!("expected a chunk");
            };
            chunks += 1;
            let received = receiver.on_chunk(&chunk).await.unwrap();
            let acked = sender.on_ack(&mut send_c).await;
            assert!(acked.failed.is_none());
            wire.extend(acked.outbound);
            if acked.finished {
                assert!(received.finished);
                finished = true;
            }
        }

        assert!(finished);
        assert_eq!(chunks, 4);
        assert_eq!(std::fs::read(dst.path().join("big.bin")).unwrap(), big);
        assert_eq!(std::fs::read(dst.path().join("empty")).unwrap(), Vec::<u8>::new());
        assert_eq!(std::fs::read(dst.path().join("small.bin")).unwrap(), small);
    }

    #[tokio::test]
    async fn test_batch_of_empty_files_completes_on_accept() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let paths = write_files(src.path(), &[("a", vec![]), ("b", vec![])]);

        let (mut send_c, _) = ciphers();
        let mut sender = FilesSender::open(&paths, 10).await.unwrap();
        let step = sender.on_accept(&mut send_c).await;
        assert!(step.finished);
        assert!(step.outbound.is_empty());
        assert_eq!(step.progress.len(), 2);

        let mut receiver = FilesReceiver::new(sender.files(), dst.path().to_path_buf(), AskPath::Notification);
        assert!(receiver.accept().await.unwrap().finished);
        assert_eq!(receiver.saved_paths().len(), 2);
    }

    #[tokio::test]
    async fn test_peer_abort_rewinds_prefetched_chunk() {
        let src = tempfile::tempdir().unwrap();
        let paths = write_files(src.path(), &[("data", vec![1u8; 30])]);
        let (mut send_c, mut recv_c) = ciphers();

        let mut sender = FilesSender::open(&paths, 10).await.unwrap();
        let first = sender.on_accept(&mut send_c).await.outbound;
        assert_eq!(first.len(), 1);
        assert_eq!(send_c.counter(), 2);

        sender.defer(Message::Text("after".into()).encode().unwrap());
        let out = sender.abort_by_peer(&mut send_c).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(send_c.counter(), 2);

        assert!(matches!(
            read_message(&mut recv_c, &first[0]).await,
            Message::LargeFileChunk(_)
        ));
        assert_eq!(
            read_message(&mut recv_c, &out[0]).await,
            Message::Text("after".into())
        );
    }

    #[tokio::test]
    async fn test_local_cancel_flushes_chunk_then_deferred() {
        let src = tempfile::tempdir().unwrap();
        let paths = write_files(src.path(), &[("data", vec![1u8; 30])]);
        let (mut send_c, mut recv_c) = ciphers();

        let mut sender = FilesSender::open(&paths, 10).await.unwrap();
        let first = sender.on_accept(&mut send_c).await.outbound;
        sender.defer(Message::Name("Zoe".into()).encode().unwrap());
        let out = sender.cancel(&mut send_c).unwrap();
        assert_eq!(out.len(), 2);

        read_message(&mut recv_c, &first[0]).await;
        assert!(matches!(
            read_message(&mut recv_c, &out[0]).await,
            Message::LargeFileChunk(_)
        ));
        assert_eq!(
            read_message(&mut recv_c, &out[1]).await,
            Message::Name("Zoe".into())
        );
    }

    #[tokio::test]
    async fn test_truncated_source_fails_but_keeps_sealed_records() {
        let src = tempfile::tempdir().unwrap();
        let paths = write_files(src.path(), &[("shrinks", vec![3u8; 30])]);
        let (mut send_c, _) = ciphers();

        let mut sender = FilesSender::open(&paths, 10).await.unwrap();
        std::fs::write(&paths[0], vec![3u8; 12]).unwrap();

        let first = sender.on_accept(&mut send_c).await;
        assert!(first.failed.is_none());
        assert_eq!(first.outbound.len(), 1);

        let step = sender.on_ack(&mut send_c).await;
        assert!(matches!(step.failed, Some(TransferError::Unreadable(_))));
        // the prefetched 2-byte chunk was already sealed and must still be written
        assert_eq!(step.outbound.len(), 1);
        assert_eq!(send_c.counter(), 2);
    }

    #[tokio::test]
    async fn test_receiver_does_not_clobber_or_escape() {
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(dst.path().join("photo.jpg"), b"existing").unwrap();

        let files = vec![
            FileInfo {
                name: "photo.jpg".into(),
                size: 3,
            },
            FileInfo {
                name: "../escape.txt".into(),
                size: 2,
            },
        ];
        let mut receiver = FilesReceiver::new(files, dst.path().to_path_buf(), AskPath::Prompt);
        receiver.accept().await.unwrap();
        receiver.on_chunk(b"new").await.unwrap();
        let step = receiver.on_chunk(b"ok").await.unwrap();
        assert!(step.finished);

        assert_eq!(std::fs::read(dst.path().join("photo.jpg")).unwrap(), b"existing");
        assert_eq!(std::fs::read(dst.path().join("photo (1).jpg")).unwrap(), b"new");
        assert_eq!(std::fs::read(dst.path().join("escape.txt")).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_receiver_rejects_oversized_chunk() {
        let dst = tempfile::tempdir().unwrap();
        let files = vec![FileInfo {
            name: "tiny".into(),
            size: 2,
        }];
        let mut receiver = FilesReceiver::new(files, dst.path().to_path_buf(), AskPath::Prompt);
        assert!(matches!(
            receiver.on_chunk(b"xx").await,
            Err(TransferError::NoTransfer)
        ));
        receiver.accept().await.unwrap();
        assert!(matches!(
            receiver.on_chunk(b"xyz").await,
            Err(TransferError::Unwritable(_))
        ));
        receiver.abort().await;
        assert!(!dst.path().join("tiny").exists());
    }

    #[tokio::test]
    async fn test_unreadable_path_fails_open() {
        let result = FilesSender::open(&[PathBuf::from("/nonexistent/murmur/file")], 10).await;
        assert!(matches!(result, Err(TransferError::Unreadable(_))));
    }
}
