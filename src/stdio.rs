//! `Content-Length` framed JSON transport for the worker protocol.
//!
//! Each frame on stdin carries one request; each response is written as its
//! own frame on stdout as soon as the worker produces it.

use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::settings::EngineSettings;
use crate::worker::WorkerHandle;
use serde_json::Value;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::sync::mpsc;
use std::thread;
use taxonium_protocol::{Request, Response, StatusMessage};

pub fn run_stdio_worker(settings: EngineSettings) -> EngineResult<()> {
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(io::stdout());
    run_worker_loop(settings, &mut reader, &mut writer)
}

/// Feeds framed requests from `reader` to a worker thread until EOF and
/// writes every response to `writer`. Returns once the worker has answered
/// everything it received.
pub fn run_worker_loop<R: BufRead, W: Write + Send>(
    settings: EngineSettings,
    reader: &mut R,
    writer: &mut W,
) -> EngineResult<()> {
    let (replies, responses) = mpsc::channel::<Response>();
    thread::scope(|scope| {
        let output = scope.spawn(move || -> EngineResult<()> {
            for response in responses {
                write_framed_json(writer, &serde_json::to_value(&response)?)?;
            }
            Ok(())
        });

        let mut worker = WorkerHandle::spawn(settings, replies.clone());
        let input = read_requests(reader, &worker, &replies);
        worker.shutdown();
        drop(replies);

        let written = output
            .join()
            .map_err(|_| EngineError::new(ErrorCode::Internal, "Response writer panicked"))?;
        input.and(written)
    })
}

fn read_requests<R: BufRead>(
    reader: &mut R,
    worker: &WorkerHandle,
    replies: &mpsc::Sender<Response>,
) -> EngineResult<()> {
    while let Some(message) = read_framed_json(reader)? {
        match serde_json::from_value::<Request>(message) {
            Ok(request) => worker.send(request)?,
            Err(err) => {
                log::warn!("Rejecting malformed request: {err}");
                let rejection = Response::Status {
                    job_id: None,
                    data: StatusMessage::failure(format!("Invalid request: {err}")),
                };
                replies
                    .send(rejection)
                    .map_err(|_| EngineError::new(ErrorCode::Internal, "Response writer stopped"))?;
            }
        }
    }
    Ok(())
}

fn io_error(context: &str, err: io::Error) -> EngineError {
    EngineError::new(ErrorCode::Io, format!("{context}: {err}"))
}

/// Next frame from `reader`, or `None` at a clean end of input.
fn read_framed_json<R: BufRead>(reader: &mut R) -> EngineResult<Option<Value>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .map_err(|e| io_error("Could not read frame header", e))?;
        if bytes_read == 0 {
            return match content_length {
                Some(_) => Err(EngineError::invalid("Input ended inside a frame header")),
                None => Ok(None),
            };
        }
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(value) = header.strip_prefix("Content-Length:") {
            let len = value.trim().parse::<usize>().map_err(|e| {
                EngineError::invalid(format!("Bad Content-Length in '{header}': {e}"))
            })?;
            content_length = Some(len);
        }
    }

    let len = content_length.ok_or_else(|| EngineError::invalid("Frame has no Content-Length"))?;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| io_error("Could not read frame body", e))?;
    Ok(Some(serde_json::from_slice::<Value>(&body)?))
}

fn write_framed_json<W: Write>(writer: &mut W, payload: &Value) -> EngineResult<()> {
    let body = serde_json::to_vec(payload)?;
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
        .and_then(|_| writer.write_all(&body))
        .and_then(|_| writer.flush())
        .map_err(|e| io_error("Could not write response frame", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn frame(value: &Value) -> Vec<u8> {
        let body = serde_json::to_vec(value).expect("serialize test message");
        let mut bytes = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        bytes.extend(body);
        bytes
    }

    fn read_all(buffer: &[u8]) -> Vec<Value> {
        let mut reader = Cursor::new(buffer.to_vec());
        let mut out = Vec::new();
        while let Some(value) = read_framed_json(&mut reader).expect("framed output") {
            out.push(value);
        }
        out
    }

    fn run(messages: &[Value]) -> Vec<Value> {
        let input: Vec<u8> = messages.iter().flat_map(frame).collect();
        let mut reader = Cursor::new(input);
        let mut writer = Vec::<u8>::new();
        run_worker_loop(EngineSettings::default(), &mut reader, &mut writer).expect("worker loop");
        read_all(&writer)
    }

    #[test]
    fn test_query_before_upload_is_answered_after_it() {
        let out = run(&[
            json!({"type": "query", "jobId": 2}),
            json!({"type": "upload", "jobId": 1, "data": {"filename": "t.nwk", "data": "(A:1,B:2);"}}),
        ]);
        let kinds: Vec<&str> = out.iter().filter_map(|v| v["type"].as_str()).collect();
        assert_eq!(kinds.last(), Some(&"query"));
        let query = out.last().unwrap();
        assert_eq!(query["jobId"], json!(2));
        assert_eq!(query["data"]["nodes"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_malformed_request_gets_error_status() {
        let out = run(&[json!({"type": "teleport"})]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["type"], json!("status"));
        assert!(out[0]["data"]["error"].as_str().unwrap().starts_with("Invalid request"));
    }

    #[test]
    fn test_headers_without_length_are_skipped_until_eof() {
        let mut reader = Cursor::new(b"X-Other: 1\r\n\r\n".to_vec());
        assert_eq!(read_framed_json(&mut reader), Ok(None));
    }

    #[test]
    fn test_bad_content_length_is_error() {
        let mut reader = Cursor::new(b"Content-Length: abc\r\n\r\n".to_vec());
        let err = read_framed_json(&mut reader).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        let mut reader = Cursor::new(b"Content-Length: 10\r\n".to_vec());
        assert!(read_framed_json(&mut reader).is_err());
    }

    #[test]
    fn test_stdout_writer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<BufWriter<io::Stdout>>();
    }
}
