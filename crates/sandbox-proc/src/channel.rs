//! Supervisor side of the worker result channel.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use worker_proto::{
    Decoder, MSG_OUTCOME, MSG_REQUEST, MSG_STDERR, MSG_STDOUT, ProtocolError, RawMessage,
};

/// The outcome frame, decoded into owned values.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WorkerOutcome {
    pub status: u8,
    pub value: Option<serde_json::Value>,
    pub error: String,
}

/// Everything the worker reported so far. Survives a timeout so partial
/// output is kept.
#[derive(Debug, Default)]
pub(crate) struct Collected {
    pub stdout: String,
    pub stderr: String,
    pub outcome: Option<WorkerOutcome>,
    /// Why reading stopped early, if it did.
    pub fault: Option<String>,
    decoder: Decoder,
}

impl Collected {
    fn apply(&mut self, msg: RawMessage) -> Result<(), ProtocolError> {
        match msg.msg_type {
            MSG_STDOUT => self.stdout.push_str(worker_proto::decode_text(&msg.payload)?),
            MSG_STDERR => self.stderr.push_str(worker_proto::decode_text(&msg.payload)?),
            MSG_OUTCOME => {
                let outcome = worker_proto::decode_outcome(&msg.payload)?;
                let value = match outcome.value {
                    Some(json) => Some(
                        serde_json::from_str(json)
                            .map_err(|_| ProtocolError::InvalidPayload("outcome value is not JSON"))?,
                    ),
                    None => None,
                };
                self.outcome = Some(WorkerOutcome {
                    status: outcome.status,
                    value,
                    error: outcome.error.to_owned(),
                });
            }
            other => return Err(ProtocolError::UnexpectedMessage(other)),
        }
        Ok(())
    }

    fn feed(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        for msg in self.decoder.decode(data)? {
            self.apply(msg)?;
        }
        Ok(())
    }

    /// Bytes of a frame the worker started but never finished.
    pub fn pending(&self) -> usize {
        self.decoder.pending()
    }
}

/// Write the single request frame and close the worker's stdin.
pub(crate) async fn send_request<W>(mut stdin: W, source: &str, input: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = worker_proto::encode_request(source, input);
    let frame = worker_proto::encode(MSG_REQUEST, &payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    stdin.write_all(&frame).await?;
    stdin.flush().await?;
    stdin.shutdown().await
}

/// Read frames into `collected` until the worker closes its end.
///
/// Cancel-safe: dropping the future keeps everything decoded so far, and a
/// later call picks up where this one stopped.
pub(crate) async fn read_frames<R>(reader: &mut R, collected: &mut Collected)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                collected.fault = Some(format!("channel read failed: {e}"));
                return;
            }
        };
        let data = buf.get(..n).unwrap_or_default();
        if let Err(e) = collected.feed(data) {
            collected.fault = Some(format!("corrupt channel: {e}"));
            return;
        }
    }
}
