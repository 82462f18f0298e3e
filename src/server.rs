// The TCP session layer.
//
// Framing is an 8-byte big-endian length prefix in both directions. A
// session reads exactly one request, streams header/pixel frame pairs back,
// and closes right after the final pair. The read half is watched for the
// duration: the client sends nothing after its request, so any read
// completion is a disconnect and cancels the generation in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::{pin_mut, StreamExt};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::ConfigModule;
use crate::error::Error;
use crate::generator::{Event, GeneratorModule};
use crate::params::{Job, Request};
use crate::pixels::{self, Rectangle};

/// Requests are small; anything bigger than this is not one.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

pub struct ListenTask {
    config: ConfigModule,
    generator: GeneratorModule,
    listen: Option<String>,
}

impl ListenTask {
    pub fn new(config: ConfigModule, generator: GeneratorModule, listen: Option<String>) -> Self {
        Self {
            config,
            generator,
            listen,
        }
    }

    pub async fn run(self) -> Result<()> {
        let listen = match &self.listen {
            Some(listen) => listen.clone(),
            None => self.config.with_config(|c| c.listen.clone()).await,
        };

        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        info!("Listening on {listen}");

        self.serve(listener).await
    }

    async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .context("failed to accept connection")?;
            debug!("Connection from {peer}");

            let config = self.config.clone();
            let generator = self.generator.clone();
            tokio::spawn(async move {
                if let Err(error) = session(stream, config, generator).await {
                    warn!("Session with {peer} ended: {error:#}");
                }
            });
        }
    }
}

/// Response frame header. The final header additionally carries the region
/// metadata; preview headers omit those keys entirely.
#[derive(Serialize)]
struct Header<'a> {
    width: u32,
    height: u32,
    progress: f32,
    is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    faces: Option<&'a [Rectangle]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hands: Option<&'a [Rectangle]>,
}

async fn session(
    mut stream: TcpStream,
    config: ConfigModule,
    generator: GeneratorModule,
) -> Result<()> {
    let mut buffer = Vec::new();
    let size = read_frame(&mut stream, &mut buffer)
        .await
        .context("failed to read request")?;
    let payload = &buffer[..size];
    trace!("Received: {}", String::from_utf8_lossy(payload));

    // The desktop client probes readiness with a ping before it sends work.
    #[derive(Deserialize)]
    struct Probe {
        #[serde(default)]
        task: Option<String>,
    }

    let probe: Probe = serde_json::from_slice(payload).context("malformed request")?;
    if probe.task.as_deref() == Some("ping") {
        write_json(&mut stream, &true).await?;
        return Ok(());
    }

    let request: Request = serde_json::from_slice(payload).context("malformed request")?;
    let job = {
        let config = config.with_config(|c| c.clone()).await;
        request.resolve(&config).context("rejected request")?
    };

    let (mut reader, mut writer) = stream.into_split();
    let cancelled = Arc::new(AtomicBool::new(false));

    // Watch for a disconnect while the accelerator is busy. The client
    // sends nothing after its request, so any read completion means the
    // connection is done for.
    let watcher = tokio::spawn({
        let cancelled = cancelled.clone();
        async move {
            let mut scratch = [0u8; 1];
            let _ = reader.read(&mut scratch).await;
            cancelled.store(true, Ordering::Relaxed);
        }
    });

    let result = drive(&mut writer, &generator, job, cancelled).await;
    watcher.abort();
    result
}

/// Relays the generation's event stream onto the socket.
async fn drive<W>(
    writer: &mut W,
    generator: &GeneratorModule,
    job: Job,
    cancelled: Arc<AtomicBool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let events = generator.generate(job, cancelled.clone());
    pin_mut!(events);

    while let Some(event) = events.next().await {
        match event {
            Event::Preview { ratio, image } => {
                let header = Header {
                    width: image.width(),
                    height: image.height(),
                    progress: ratio,
                    is_final: false,
                    faces: None,
                    hands: None,
                };

                if let Err(error) = send_pair(writer, &header, image.as_raw()).await {
                    // The caller is gone; the pipeline notices at its next
                    // step boundary.
                    cancelled.store(true, Ordering::Relaxed);
                    return Err(error).context("failed to stream preview");
                }
            }
            Event::Completed(generation) => {
                let mut image = generation.image;
                pixels::opaque(&mut image);

                let header = Header {
                    width: image.width(),
                    height: image.height(),
                    progress: 1.0,
                    is_final: true,
                    faces: Some(&generation.faces),
                    hands: Some(&generation.hands),
                };
                send_pair(writer, &header, image.as_raw())
                    .await
                    .context("failed to send the final frame")?;

                // The server closes right after the final pair.
                let _ = writer.shutdown().await;
                return Ok(());
            }
            Event::Error(Error::Interrupted) => {
                debug!("Generation dropped with its caller");
                return Ok(());
            }
            Event::Error(error) => {
                // All-or-nothing: no partial response, just the log and a
                // closed connection.
                return Err(anyhow::Error::new(error)).context("generation failed");
            }
        }
    }

    bail!("generation stream ended without a terminal event")
}

async fn send_pair<W>(stream: &mut W, header: &Header<'_>, pixels: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_json(stream, header).await?;
    write_frame(stream, pixels).await
}

/// Reads one length-prefixed frame into `buffer`, returning its size.
async fn read_frame<R>(stream: &mut R, buffer: &mut Vec<u8>) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let size = stream
        .read_u64()
        .await
        .context("failed to read frame size")? as usize;
    if size > MAX_REQUEST_SIZE {
        bail!("oversized frame: {size} bytes");
    }

    if buffer.len() < size {
        buffer.resize(size, 0);
    }
    stream
        .read_exact(&mut buffer[..size])
        .await
        .context("failed to read frame")?;

    Ok(size)
}

async fn write_frame<W>(stream: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_u64(bytes.len() as u64).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;

    Ok(())
}

async fn write_json<W, T>(stream: &mut W, data: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(data).context("failed to serialize frame")?;
    write_frame(stream, &bytes).await
}
