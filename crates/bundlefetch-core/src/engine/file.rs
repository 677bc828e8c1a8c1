//! `file://` transport for local mirrors
//!
//! Copies on a plain worker thread with the same range/append behaviour as
//! the HTTP transport. A missing source reports status 404 and a range
//! starting past the end of the source reports 416.

use crate::dispatch::Dispatcher;
use crate::engine::transport::{
    TransferHandle, TransferOutcome, TransferState, Transport, TransportRequest, WorkerTransfer,
};
use crate::error::{BundleError, BundleResult};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const COPY_CHUNK: usize = 64 * 1024;

pub struct FileTransport {
    dispatcher: Dispatcher,
}

impl FileTransport {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

impl Transport for FileTransport {
    fn send(&self, request: TransportRequest) -> BundleResult<Box<dyn TransferHandle>> {
        let source = url::Url::parse(&request.url)?
            .to_file_path()
            .map_err(|_| BundleError::InvalidUrl(request.url.clone()))?;

        let state = TransferState::new();
        let worker_state = Arc::clone(&state);
        let dispatcher = self.dispatcher.clone();
        std::thread::Builder::new()
            .name("bundlefetch-file".into())
            .spawn(move || {
                let outcome = copy(&source, &request, &worker_state);
                debug!(url = %request.url, status = ?outcome.status, error = ?outcome.error, "file transfer finished");
                worker_state.finish(&dispatcher, outcome);
            })?;

        Ok(Box::new(WorkerTransfer::new(state)))
    }
}

fn copy(source: &Path, request: &TransportRequest, state: &TransferState) -> TransferOutcome {
    let mut input = match File::open(source) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return TransferOutcome::failed(Some(404), format!("{} not found", source.display()))
        }
        Err(e) => return TransferOutcome::failed(None, e.to_string()),
    };
    let len = match input.metadata() {
        Ok(m) => m.len(),
        Err(e) => return TransferOutcome::failed(None, e.to_string()),
    };

    let start = request.range_start.unwrap_or(0);
    if start > len {
        return TransferOutcome::failed(Some(416), format!("range start {} beyond {} bytes", start, len));
    }
    state.set_expected(len - start);

    let opened = if request.range_start.is_some() {
        OpenOptions::new().create(true).append(true).open(&request.save_path)
    } else {
        File::create(&request.save_path)
    };
    let mut output = match opened {
        Ok(f) => f,
        Err(e) => return TransferOutcome::failed(None, e.to_string()),
    };
    if let Err(e) = input.seek(SeekFrom::Start(start)) {
        return TransferOutcome::failed(None, e.to_string());
    }

    let mut buffer = vec![0u8; COPY_CHUNK];
    loop {
        if state.is_cancelled() {
            return TransferOutcome::failed(None, "aborted");
        }
        let n = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return TransferOutcome::failed(None, e.to_string()),
        };
        if let Err(e) = output.write_all(&buffer[..n]) {
            return TransferOutcome::failed(None, e.to_string());
        }
        state.add_bytes(n as u64);
    }
    if let Err(e) = output.flush() {
        return TransferOutcome::failed(None, e.to_string());
    }

    TransferOutcome::ok(if request.range_start.is_some() { 206 } else { 200 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::callback_queue;
    use std::time::{Duration, Instant};

    fn wait(handle: &dyn TransferHandle, queue: &mut crate::dispatch::CallbackQueue) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_done() && Instant::now() < deadline {
            queue.drain();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn file_url(path: &std::path::Path) -> String {
        url::Url::from_file_path(path).unwrap().to_string()
    }

    #[test]
    fn test_range_request_appends() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &data).unwrap();
        let save = dir.path().join("partial");
        std::fs::write(&save, &data[..40_000]).unwrap();

        let (dispatcher, mut queue) = callback_queue();
        let transport = FileTransport::new(dispatcher);
        let handle = transport
            .send(TransportRequest {
                url: file_url(&source),
                range_start: Some(40_000),
                save_path: save.clone(),
                timeout: None,
            })
            .unwrap();
        wait(handle.as_ref(), &mut queue);

        assert!(!handle.has_error());
        assert_eq!(handle.status_code(), Some(206));
        assert_eq!(handle.bytes_transferred(), 60_000);
        assert_eq!(std::fs::read(&save).unwrap(), data);
    }

    #[test]
    fn test_missing_source_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut queue) = callback_queue();
        let transport = FileTransport::new(dispatcher);
        let handle = transport
            .send(TransportRequest {
                url: file_url(&dir.path().join("nope")),
                range_start: None,
                save_path: dir.path().join("out"),
                timeout: None,
            })
            .unwrap();
        wait(handle.as_ref(), &mut queue);

        assert!(handle.has_error());
        assert_eq!(handle.status_code(), Some(404));
    }
}
