//! Per-connection request handling.
//!
//! Requests on one connection are serialized; a streaming operation (run,
//! attach, stream-in, stream-out) takes over the connection and the daemon
//! closes it when the stream finishes. Clients issue concurrent operations
//! over separate connections.

use std::sync::Arc;

use burrow_shared::protocol::{decode_chunk, encode_chunk, Request, Response, StreamChunk};
use burrow_shared::{BurrowError, BurrowResult};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf};
use tokio::sync::{broadcast, mpsc};

use crate::backend::Backend;
use crate::container::Container;
use crate::process::Process;
use crate::server::Conn;

type ConnReader = Lines<BufReader<ReadHalf<Box<dyn Conn>>>>;

pub(super) async fn handle(backend: Backend, stream: Box<dyn Conn>) -> BurrowResult<()> {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request = match Request::from_json(&line) {
            Ok(request) => request,
            Err(e) => {
                let err = BurrowError::InvalidArgument(format!("undecodable request: {}", e));
                write_response(&mut writer, &Response::error(&err)).await?;
                continue;
            }
        };

        match request {
            Request::Run { handle, spec } => {
                let outcome = match backend.lookup(&handle) {
                    Ok(container) => match container.run(&spec) {
                        Ok(process) => {
                            let id = process.id();
                            write_response(&mut writer, &Response::ProcessStarted { process_id: id })
                                .await?;
                            stream_process(process, &mut lines, &mut writer).await
                        }
                        Err(e) => write_response(&mut writer, &Response::error(&e)).await,
                    },
                    Err(e) => write_response(&mut writer, &Response::error(&e)).await,
                };
                return outcome;
            }
            Request::Attach { handle, process_id } => {
                let outcome = match backend.lookup(&handle) {
                    Ok(container) => match container.attach(process_id) {
                        Ok(process) => stream_process(process, &mut lines, &mut writer).await,
                        Err(e) => write_response(&mut writer, &Response::error(&e)).await,
                    },
                    Err(e) => write_response(&mut writer, &Response::error(&e)).await,
                };
                return outcome;
            }
            Request::StreamIn { handle, dst_path } => {
                return stream_in(&backend, &handle, &dst_path, &mut lines, &mut writer).await;
            }
            Request::StreamOut { handle, src_path } => {
                return stream_out(&backend, &handle, &src_path, &mut writer).await;
            }
            other => {
                let response = dispatch(&backend, other).await;
                write_response(&mut writer, &response).await?;
            }
        }
    }
    Ok(())
}

/// Unary request dispatch. Every handle-bearing request resolves through
/// `Backend::lookup`, which also resets the container's grace timer.
async fn dispatch(backend: &Backend, request: Request) -> Response {
    let result = dispatch_inner(backend, request).await;
    match result {
        Ok(response) => response,
        Err(e) => Response::error(&e),
    }
}

async fn dispatch_inner(backend: &Backend, request: Request) -> BurrowResult<Response> {
    match request {
        Request::Ping => {
            backend.ping().await?;
            Ok(Response::Ok)
        }
        Request::Capacity => {
            let capacity = backend.capacity()?;
            Ok(Response::Capacity {
                memory_bytes: capacity.memory_bytes,
                disk_bytes: capacity.disk_bytes,
                max_containers: capacity.max_containers,
            })
        }
        Request::Create { spec } => {
            let container = backend.create(spec).await?;
            Ok(Response::Handle {
                handle: container.handle().to_string(),
            })
        }
        Request::Destroy { handle } => {
            backend.destroy(&handle).await?;
            Ok(Response::Ok)
        }
        Request::List { properties } => Ok(Response::Handles {
            handles: backend.handles(&properties),
        }),
        Request::Stop { handle, kill } => {
            backend.lookup(&handle)?.stop(kill).await?;
            Ok(Response::Ok)
        }
        Request::Info { handle } => Ok(Response::Info {
            info: backend.lookup(&handle)?.info(),
        }),
        Request::LimitBandwidth { handle, limits } => {
            backend.lookup(&handle)?.limit_bandwidth(limits).await?;
            Ok(Response::Ok)
        }
        Request::CurrentBandwidthLimits { handle } => Ok(Response::BandwidthLimits {
            limits: backend.lookup(&handle)?.current_bandwidth_limits(),
        }),
        Request::LimitMemory { handle, limits } => {
            backend.lookup(&handle)?.limit_memory(limits).await?;
            Ok(Response::Ok)
        }
        Request::CurrentMemoryLimits { handle } => Ok(Response::MemoryLimits {
            limits: backend.lookup(&handle)?.current_memory_limits(),
        }),
        Request::LimitDisk { handle, limits } => {
            backend.lookup(&handle)?.limit_disk(limits).await?;
            Ok(Response::Ok)
        }
        Request::CurrentDiskLimits { handle } => Ok(Response::DiskLimits {
            limits: backend.lookup(&handle)?.current_disk_limits(),
        }),
        Request::LimitCpu { handle, limits } => {
            backend.lookup(&handle)?.limit_cpu(limits).await?;
            Ok(Response::Ok)
        }
        Request::CurrentCpuLimits { handle } => Ok(Response::CpuLimits {
            limits: backend.lookup(&handle)?.current_cpu_limits(),
        }),
        Request::NetIn {
            handle,
            host_port,
            container_port,
        } => {
            let (host_port, container_port) = backend
                .lookup(&handle)?
                .net_in(host_port, container_port)
                .await?;
            Ok(Response::NetIn {
                host_port,
                container_port,
            })
        }
        Request::NetOut {
            handle,
            network,
            port,
        } => {
            backend.lookup(&handle)?.net_out(&network, port).await?;
            Ok(Response::Ok)
        }
        Request::Run { .. }
        | Request::Attach { .. }
        | Request::StreamIn { .. }
        | Request::StreamOut { .. } => Err(BurrowError::Internal(
            "streaming request reached unary dispatch".into(),
        )),
    }
}

// ============================================================================
// STREAMING
// ============================================================================

/// Forward a process's stdio to the client and the client's chunks to its
/// stdin, finishing with the exit status. Bytes emitted while no consumer was
/// attached are not replayed.
async fn stream_process<W>(
    mut process: Process,
    lines: &mut ConnReader,
    writer: &mut W,
) -> BurrowResult<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(status) = process.exited() {
        return write_response(writer, &Response::ExitStatus { status }).await;
    }

    let stdin_tx = process.stdin();
    let mut exit_rx = process.exit_watch();
    let mut stdout = process
        .stdout()
        .ok_or_else(|| BurrowError::Internal("process stdout already taken".into()))?;
    let mut stderr = process
        .stderr()
        .ok_or_else(|| BurrowError::Internal("process stderr already taken".into()))?;

    let mut status = process.exited();
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut stdin_open = true;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if forward_stdin(&stdin_tx, &line).await? {
                            stdin_open = false;
                        }
                    }
                    // Client stopped sending; the process keeps running and
                    // stays attachable.
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            chunk = next_chunk(&mut stdout), if !stdout_done => {
                match chunk {
                    Some(data) if !data.is_empty() => {
                        write_response(writer, &Response::Stdout { data: encode_chunk(&data) }).await?;
                    }
                    _ => stdout_done = true,
                }
            }
            chunk = next_chunk(&mut stderr), if !stderr_done => {
                match chunk {
                    Some(data) if !data.is_empty() => {
                        write_response(writer, &Response::Stderr { data: encode_chunk(&data) }).await?;
                    }
                    _ => stderr_done = true,
                }
            }
            changed = exit_rx.changed(), if status.is_none() => {
                if changed.is_ok() {
                    status = *exit_rx.borrow();
                } else {
                    status = Some(-1);
                }
                // The exit status is published only after both readers have
                // drained into the fanout, so whatever this consumer has
                // left is already buffered. A consumer that subscribed after
                // the end-of-stream markers has nothing pending at all.
                if status.is_some() {
                    flush_buffered(&mut stdout, writer, false).await?;
                    flush_buffered(&mut stderr, writer, true).await?;
                    break;
                }
            }
        }
    }

    let status = match status {
        Some(status) => status,
        None => process.wait().await?,
    };
    write_response(writer, &Response::ExitStatus { status }).await
}

/// Decode one client frame into the stdin funnel. Returns true when the
/// client closed stdin.
async fn forward_stdin(stdin_tx: &mpsc::Sender<Vec<u8>>, line: &str) -> BurrowResult<bool> {
    let chunk = match StreamChunk::from_json(line) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring undecodable stdin frame");
            return Ok(false);
        }
    };
    if !chunk.data.is_empty() {
        let data = decode_chunk(&chunk.data)?;
        // A full funnel applies backpressure to this client only.
        let _ = stdin_tx.send(data).await;
    }
    if chunk.eof {
        let _ = stdin_tx.send(Vec::new()).await;
        return Ok(true);
    }
    Ok(false)
}

/// Forward whatever a fanout subscription has buffered, without waiting for
/// more. Used once the exit status is known.
async fn flush_buffered<W>(
    rx: &mut broadcast::Receiver<Vec<u8>>,
    writer: &mut W,
    is_stderr: bool,
) -> BurrowResult<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match rx.try_recv() {
            Ok(data) if !data.is_empty() => {
                let data = encode_chunk(&data);
                let response = if is_stderr {
                    Response::Stderr { data }
                } else {
                    Response::Stdout { data }
                };
                write_response(writer, &response).await?;
            }
            Ok(_) => return Ok(()),
            Err(broadcast::error::TryRecvError::Lagged(dropped)) => {
                tracing::debug!(dropped, "slow consumer lost stdio chunks");
            }
            Err(_) => return Ok(()),
        }
    }
}

/// Next chunk from a stdio fanout. `None` means the stream closed; a lag
/// means this consumer was too slow and lost bytes, which the fanout prefers
/// over stalling the process.
async fn next_chunk(rx: &mut broadcast::Receiver<Vec<u8>>) -> Option<Vec<u8>> {
    loop {
        match rx.recv().await {
            Ok(chunk) => return Some(chunk),
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                tracing::debug!(dropped, "slow consumer lost stdio chunks");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn stream_in<W>(
    backend: &Backend,
    handle: &str,
    dst_path: &str,
    lines: &mut ConnReader,
    writer: &mut W,
) -> BurrowResult<()>
where
    W: AsyncWrite + Unpin,
{
    let container = match backend.lookup(handle) {
        Ok(container) => container,
        Err(e) => return write_response(writer, &Response::error(&e)).await,
    };

    let (tx, rx) = mpsc::channel(16);
    let feed = async {
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(BurrowError::from)?
        {
            let chunk = StreamChunk::from_json(&line)
                .map_err(|e| BurrowError::InvalidArgument(format!("bad stream frame: {}", e)))?;
            if !chunk.data.is_empty() {
                let data = decode_chunk(&chunk.data)?;
                if tx.send(data).await.is_err() {
                    break;
                }
            }
            if chunk.eof {
                break;
            }
        }
        drop(tx);
        Ok::<(), BurrowError>(())
    };

    let (feed_result, unpack_result) = tokio::join!(feed, container.stream_in(dst_path, rx));
    let response = match feed_result.and(unpack_result) {
        Ok(()) => Response::Ok,
        Err(e) => Response::error(&e),
    };
    write_response(writer, &response).await
}

async fn stream_out<W>(
    backend: &Backend,
    handle: &str,
    src_path: &str,
    writer: &mut W,
) -> BurrowResult<()>
where
    W: AsyncWrite + Unpin,
{
    let container: Arc<Container> = match backend.lookup(handle) {
        Ok(container) => container,
        Err(e) => return write_response(writer, &Response::error(&e)).await,
    };

    let mut chunks = match container.stream_out(src_path) {
        Ok(chunks) => chunks,
        Err(e) => return write_response(writer, &Response::error(&e)).await,
    };

    while let Some(item) = chunks.recv().await {
        match item {
            Ok(data) => {
                write_response(
                    writer,
                    &Response::Chunk {
                        data: encode_chunk(&data),
                        eof: false,
                    },
                )
                .await?;
            }
            Err(e) => return write_response(writer, &Response::error(&e)).await,
        }
    }

    write_response(
        writer,
        &Response::Chunk {
            data: String::new(),
            eof: true,
        },
    )
    .await
}

async fn write_response<W>(writer: &mut W, response: &Response) -> BurrowResult<()>
where
    W: AsyncWrite + Unpin,
{
    let line = response
        .to_json_line()
        .map_err(|e| BurrowError::Internal(format!("unencodable response: {}", e)))?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
