//! TCP front end: accepts connections and drives each one through a
//! [`Session`].
use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::broker::Broker;
use crate::line_reader::LineReader;
use crate::session::{Reply, Session};
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::util::bytes_to_human_str;

/// Accepts connections until `cancel` fires, handling each as its own task.
///
/// Each connection task holds a clone of `shutdown_hold`, so the receiving
/// end sees the channel close once every connection has wound down.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        tokio::spawn(begin_handle(
            broker.clone(),
            cancel.clone(),
            shutdown_hold.clone(),
            conn,
        ));
    }

    Ok(())
}

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
async fn begin_handle(
    broker: Arc<Broker>,
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    mut conn: TcpStream,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let ret = handle_conn(broker, cancel, &mut conn).await;

    conn.shutdown().await.context("during shutdown")?;

    debug!("closed connection");

    ret
}

async fn handle_conn(
    broker: Arc<Broker>,
    cancel: CancellationToken,
    conn: &mut TcpStream,
) -> Result<()> {
    // Split conn into read and write halves, where the read half uses our
    // LineReader.
    let (r, mut w) = conn.split();
    let mut r: LineReader<_> = r.into();

    let max_job_size = broker.config().max_job_size;
    let session = Session::new(broker);
    debug!(ctx = %session.context().id(), "session started");

    // A request that arrived while a reservation was outstanding.
    let mut stashed = None;

    loop {
        let line = match stashed.take() {
            Some(line) => line,
            None => select! {
                x = r.read_line() => match x {
                    Ok(Some(x)) => x,
                    Ok(None) => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        respond(&mut w, &cancel, &BeanstalkResponse::BadFormat)
                            .await?;
                        return Ok(());
                    },
                    Err(e) => return Err(e.into()),
                },
                _ = cancel.cancelled() => return Ok(()),
            },
        };

        trace!(line = bytes_to_human_str(&line), "processing command");

        let reply = match BeanstalkCommand::try_from(&line[..]) {
            Err(error) => Reply::Now(error.into()),

            Ok(BeanstalkCommand::Put { n_bytes, .. })
                if n_bytes > max_job_size =>
            {
                let discarded = select! {
                    x = r.discard(n_bytes as usize + 2) => x?,
                    _ = cancel.cancelled() => return Ok(()),
                };
                if !discarded {
                    return Ok(());
                }
                Reply::Now(BeanstalkResponse::JobTooBig)
            },

            Ok(cmd @ BeanstalkCommand::Put { n_bytes, .. }) => {
                let n_bytes = n_bytes as usize;
                let body = select! {
                    x = r.read_exact(n_bytes + 2) => x?,
                    _ = cancel.cancelled() => return Ok(()),
                };
                match body {
                    None => return Ok(()),
                    Some(body) if body.ends_with(b"\r\n") => {
                        session.dispatch(cmd, Some(body.slice(..n_bytes)))
                    },
                    Some(_) => Reply::Now(BeanstalkResponse::ExpectedCRLF),
                }
            },

            Ok(cmd) => session.dispatch(cmd, None),
        };

        let resp = match reply {
            Reply::Now(resp) => resp,
            Reply::Close => return Ok(()),
            // Keep reading while the reservation is outstanding so a hang-up
            // is noticed, holding back at most one pipelined request.
            Reply::Later(mut rx) => loop {
                select! {
                    outcome = &mut rx => match outcome {
                        Ok(outcome) => break BeanstalkResponse::from(outcome),
                        Err(_) => return Ok(()),
                    },
                    x = r.read_line(), if stashed.is_none() => match x {
                        Ok(Some(line)) => stashed = Some(line),
                        Ok(None) => return Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                            let resp = BeanstalkResponse::BadFormat;
                            respond(&mut w, &cancel, &resp).await?;
                            return Ok(());
                        },
                        Err(e) => return Err(e.into()),
                    },
                    _ = cancel.cancelled() => return Ok(()),
                }
            },
        };

        if !respond(&mut w, &cancel, &resp).await? {
            return Ok(());
        }
    }
}

/// Writes out a response, returning false if cancelled first.
async fn respond<W: AsyncWrite + Unpin>(
    w: &mut W,
    cancel: &CancellationToken,
    resp: &impl BeanstalkSerialisable,
) -> io::Result<bool> {
    let out = resp.serialise_beanstalk();

    // Slightly convoluted, but ensures we write out the buffer properly with
    // cancel safety.
    select! {
        x = w.write_all(&out) => x?,
        _ = cancel.cancelled() => return Ok(false),
    };

    // Flush any buffered packets once we've written out the response. This
    // provides a pipelined response to a pipelined request.
    select! {
        x = w.flush() => x?,
        _ = cancel.cancelled() => return Ok(false),
    };

    Ok(true)
}
