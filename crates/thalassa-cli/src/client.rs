use std::path::Path;

use thalassa_protocol::{PROTOCOL_VERSION, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Client for the thalassa daemon's control socket.
pub struct ThalassaClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl ThalassaClient {
    /// Connect and consume the daemon's hello line.
    pub async fn connect(socket_path: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                anyhow::anyhow!("thalassa daemon is not running. Start it with: thalassa daemon start")
            } else {
                anyhow::anyhow!(
                    "failed to connect to thalassa daemon at {}: {e}",
                    socket_path.display()
                )
            }
        })?;

        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        match client.read_line().await? {
            Some(Response::Hello {
                protocol_version, ..
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    anyhow::bail!(
                        "daemon speaks protocol {protocol_version}, this client speaks {PROTOCOL_VERSION}"
                    );
                }
            }
            Some(other) => anyhow::bail!("expected hello from daemon, got {other:?}"),
            None => anyhow::bail!("daemon closed connection"),
        }
        Ok(client)
    }

    /// Send a request and read the response.
    pub async fn request(&mut self, req: &Request) -> anyhow::Result<Response> {
        let json = serde_json::to_string(req)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        match self.read_line().await? {
            Some(response) => Ok(response),
            None => anyhow::bail!("daemon closed connection"),
        }
    }

    /// Read the next line from the daemon (for streamed events).
    pub async fn read_line(&mut self) -> anyhow::Result<Option<Response>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let response: Response = serde_json::from_str(&line)?;
        Ok(Some(response))
    }
}
