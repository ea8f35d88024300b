//! Newline-delimited JSON between the server and its worker processes.
//!
//! The server writes one [`Prediction`] per line; the worker answers each with
//! one [`Reply`]. A worker announces itself with `Ready` once its model is
//! loaded, or `Failed` if loading did not work. `Lost` answers a request when
//! the worker's predictor broke and the worker must be replaced.
//!
//! [`Prediction`]: crate::prediction::Prediction

use std::io::{self, BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::prediction::PredictionOutput;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ready { pid: u32, model: String },
    Output(PredictionOutput),
    Failed(String),
    Lost(String),
}

pub fn encode_line<T: Serialize>(msg: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}

fn invalid_data(e: serde_json::Error) -> io::Error { io::Error::new(io::ErrorKind::InvalidData, e) }

pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(msg).map_err(invalid_data)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// `Ok(None)` on end of stream.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return decode_line(&line).map(Some).map_err(invalid_data);
        }
    }
}

pub fn write_message_blocking<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let line = encode_line(msg).map_err(invalid_data)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()
}

pub fn read_message_blocking<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return decode_line(&line).map(Some).map_err(invalid_data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::Prediction;
    use serde_json::json;

    #[test]
    fn reply_wire_shapes() {
        let ready = Reply::Ready { pid: 7, model: "a".into() };
        assert_eq!(encode_line(&ready).unwrap(), "{\"ready\":{\"pid\":7,\"model\":\"a\"}}\n");
        let out = Reply::Output(PredictionOutput::Single(json!({"label": "pos"})));
        assert_eq!(encode_line(&out).unwrap(), "{\"output\":{\"single\":{\"label\":\"pos\"}}}\n");
        assert_eq!(encode_line(&Reply::Failed("x".into())).unwrap(), "{\"failed\":\"x\"}\n");
        assert_eq!(encode_line(&Reply::Lost("gone".into())).unwrap(), "{\"lost\":\"gone\"}\n");
    }

    #[test]
    fn embedded_newlines_stay_on_one_line() {
        let p = Prediction::from_json(json!({"text": "line one\nline two"})).unwrap();
        let line = encode_line(&p).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(decode_line::<Prediction>(&line).unwrap(), p);
    }

    #[test]
    fn blocking_reader_skips_blank_lines() {
        let mut input = io::Cursor::new(b"\n  \n{\"failed\":\"nope\"}\n".to_vec());
        let msg: Option<Reply> = read_message_blocking(&mut input).unwrap();
        assert_eq!(msg, Some(Reply::Failed("nope".into())));
        let eof: Option<Reply> = read_message_blocking(&mut input).unwrap();
        assert_eq!(eof, None);
    }

    #[test]
    fn garbage_is_invalid_data() {
        let mut input = io::Cursor::new(b"not json\n".to_vec());
        let err = read_message_blocking::<_, Reply>(&mut input).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn async_pipe_carries_messages() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut client_w) = tokio::io::split(client);
        let (server_r, _) = tokio::io::split(server);
        let mut server_r = tokio::io::BufReader::new(server_r);

        let work = Prediction::from_json(json!([{"a": 1}])).unwrap();
        write_message(&mut client_w, &work).await.unwrap();
        drop(client_w);

        let got: Option<Prediction> = read_message(&mut server_r).await.unwrap();
        assert_eq!(got, Some(work));
    }
}
