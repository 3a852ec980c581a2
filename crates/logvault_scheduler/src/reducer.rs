//! Reducer bridge.
//!
//! Reducer processes connect over TCP and register the address their task
//! output should stream to. Each connection gets a handler task that talks
//! to the scheduler through two unbounded queues: one carrying commands to
//! the handler, one carrying the reducer's verdicts back. An idle handler
//! offers itself on the acquisition queue; the scheduler takes one per
//! aggregation job.
//!
//! Per job, a handler:
//! 1. receives `AggregationConfig` and forwards it to the reducer
//! 2. receives `Success`/`Failure` once the job's tasks are done, forwards it
//! 3. reads the reducer's `Done` frame and reports it back

use logvault_protocol::wire::{
    AggregationConfigBody, DoneBody, Header, Message, OpCode, RegisterBody, HEADER_SIZE,
};
use logvault_protocol::{AggregationConfig, JobId, ProtocolError, ReducerAddress};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::metrics::METRICS;

#[derive(Debug, Error)]
pub enum ReducerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unexpected {got:?} frame, expected {expected:?}")]
    UnexpectedFrame { expected: OpCode, got: OpCode },

    #[error("Scheduler side of the reducer link closed")]
    Closed,

    #[error("Reducer closed the connection")]
    Disconnected,
}

/// Messages on the two reducer queues.
#[derive(Debug, Clone, PartialEq)]
pub enum ReducerHandlerMessage {
    /// Scheduler -> handler: start aggregating for this job.
    AggregationConfig {
        job_id: JobId,
        aggregation: AggregationConfig,
        max_num_results: u32,
    },
    /// Tasks succeeded (scheduler -> handler) or the reducer finished
    /// cleanly (handler -> scheduler).
    Success { job_id: JobId },
    Failure {
        job_id: JobId,
        error_message: Option<String>,
    },
}

/// The scheduler's end of one handler.
#[derive(Debug)]
pub struct ReducerLink {
    pub address: ReducerAddress,
    pub to_handler: mpsc::UnboundedSender<ReducerHandlerMessage>,
    pub from_handler: mpsc::UnboundedReceiver<ReducerHandlerMessage>,
}

/// Scheduler side of the acquisition queue.
pub struct ReducerBridge {
    available: mpsc::UnboundedReceiver<ReducerLink>,
}

/// Handler side of the acquisition queue.
#[derive(Clone)]
pub struct ReducerOffers {
    tx: mpsc::UnboundedSender<ReducerLink>,
}

pub fn bridge() -> (ReducerOffers, ReducerBridge) {
    let (tx, available) = mpsc::unbounded_channel();
    (ReducerOffers { tx }, ReducerBridge { available })
}

impl ReducerBridge {
    /// Take an idle handler if one is waiting. Handlers whose connection
    /// already died are skipped.
    pub fn try_acquire(&mut self) -> Option<ReducerLink> {
        while let Ok(link) = self.available.try_recv() {
            if !link.to_handler.is_closed() {
                return Some(link);
            }
            debug!(address = %link.address, "Skipping closed reducer handler");
        }
        None
    }
}

impl ReducerOffers {
    /// Create a fresh pair of queues and offer the scheduler end. Returns the
    /// handler end.
    pub fn offer(
        &self,
        address: &ReducerAddress,
    ) -> Option<(
        mpsc::UnboundedReceiver<ReducerHandlerMessage>,
        mpsc::UnboundedSender<ReducerHandlerMessage>,
    )> {
        let (to_handler, commands) = mpsc::unbounded_channel();
        let (reports, from_handler) = mpsc::unbounded_channel();
        let link = ReducerLink {
            address: address.clone(),
            to_handler,
            from_handler,
        };
        self.tx.send(link).ok()?;
        Some((commands, reports))
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Message, ReducerError> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let header = Header::unpack(&header)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Message::from_parts(header, payload)?)
}

async fn write_frame(stream: &mut TcpStream, message: &Message) -> Result<(), ReducerError> {
    stream.write_all(&message.to_bytes()?).await?;
    stream.flush().await?;
    Ok(())
}

fn expect(message: &Message, expected: OpCode) -> Result<(), ReducerError> {
    if message.opcode() != expected {
        return Err(ReducerError::UnexpectedFrame {
            expected,
            got: message.opcode(),
        });
    }
    Ok(())
}

/// Wait for the next command while watching the idle connection. A reducer
/// that hangs up drops its commands queue, so it is never handed a job.
async fn idle(
    stream: &mut TcpStream,
    commands: &mut mpsc::UnboundedReceiver<ReducerHandlerMessage>,
) -> Result<Option<ReducerHandlerMessage>, ReducerError> {
    let mut byte = [0u8; 1];
    let peeked = tokio::select! {
        command = commands.recv() => return Ok(command),
        peeked = stream.peek(&mut byte) => peeked?,
    };
    if peeked == 0 {
        return Err(ReducerError::Disconnected);
    }
    // An idle reducer has nothing to say.
    let frame = read_frame(stream).await?;
    Err(ReducerError::UnexpectedFrame {
        expected: OpCode::AggregationConfig,
        got: frame.opcode(),
    })
}

/// Serve one reducer connection until it closes.
pub async fn handle_reducer(mut stream: TcpStream, offers: ReducerOffers) -> Result<(), ReducerError> {
    let register = read_frame(&mut stream).await?;
    expect(&register, OpCode::Register)?;
    let RegisterBody { address } = register.decode_body()?;
    write_frame(&mut stream, &Message::new(OpCode::Ack, JobId::new(0), Vec::new())?).await?;
    METRICS.inc_reducers_registered();
    info!(address = %address, "Reducer registered");

    loop {
        let Some((mut commands, reports)) = offers.offer(&address) else {
            return Err(ReducerError::Closed);
        };

        let (job_id, aggregation, max_num_results) = match idle(&mut stream, &mut commands).await? {
            Some(ReducerHandlerMessage::AggregationConfig {
                job_id,
                aggregation,
                max_num_results,
            }) => (job_id, aggregation, max_num_results),
            Some(other) => {
                warn!(?other, "Reducer handler expected an aggregation config");
                continue;
            }
            None => return Err(ReducerError::Closed),
        };
        let body = AggregationConfigBody {
            aggregation,
            max_num_results,
        };
        write_frame(&mut stream, &Message::encode(OpCode::AggregationConfig, job_id, &body)?).await?;
        debug!(job_id = %job_id, address = %address, "Aggregation config sent");

        let verdict = match commands.recv().await {
            Some(ReducerHandlerMessage::Success { .. }) => Message::new(OpCode::JobSucceeded, job_id, Vec::new())?,
            Some(ReducerHandlerMessage::Failure { error_message, .. }) => Message::encode(
                OpCode::JobFailed,
                job_id,
                &DoneBody {
                    succeeded: false,
                    error_message,
                },
            )?,
            Some(ReducerHandlerMessage::AggregationConfig { .. }) | None => {
                let _ = reports.send(ReducerHandlerMessage::Failure {
                    job_id,
                    error_message: Some("reducer handler lost the job".to_string()),
                });
                return Err(ReducerError::Closed);
            }
        };

        let outcome = async {
            write_frame(&mut stream, &verdict).await?;
            let done = read_frame(&mut stream).await?;
            expect(&done, OpCode::Done)?;
            Ok::<DoneBody, ReducerError>(done.decode_body()?)
        }
        .await;

        match outcome {
            Ok(DoneBody {
                succeeded: true, ..
            }) => {
                let _ = reports.send(ReducerHandlerMessage::Success { job_id });
            }
            Ok(DoneBody { error_message, .. }) => {
                let _ = reports.send(ReducerHandlerMessage::Failure {
                    job_id,
                    error_message,
                });
            }
            Err(e) => {
                let _ = reports.send(ReducerHandlerMessage::Failure {
                    job_id,
                    error_message: Some(format!("reducer connection failed: {}", e)),
                });
                return Err(e);
            }
        }
        info!(job_id = %job_id, address = %address, "Reducer finished job");
    }
}

/// Accept reducer connections until shutdown.
pub async fn run_listener(
    listener: TcpListener,
    offers: ReducerOffers,
    mut shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("Reducer listener on {}", addr),
        Err(e) => warn!("Reducer listener address unknown: {}", e),
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Reducer connected");
                    let offers = offers.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_reducer(stream, offers).await {
                            warn!(%peer, "Reducer connection ended: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Reducer accept failed: {}", e),
            },
        }
    }
    info!("Reducer listener stopped");
}
