//! Coordinator/delegate transport for out-of-process analysis.
//!
//! The coordinator spawns this same executable with `--delegate` and speaks
//! a framed protocol over the child's stdin/stdout. Frames are a versioned,
//! length-prefixed envelope around a closed tagged union of message kinds,
//! so adding an operation is a compile-checked change and bulk payloads
//! cross the boundary as flattened primitive arrays.
//!
//! Inside the delegate, mutating requests land on an unbounded FIFO drained
//! by exactly one background thread that owns the real [`BulkAnalyzer`];
//! the receive loop itself never blocks on analysis work. Fetch requests
//! join the FIFO (read-after-write), then answer with an empty ack frame
//! followed by the bulk frame, letting the caller time queueing delay and
//! transfer separately.

use crate::analyzer::BulkAnalyzer;
use crate::common::{AddressRange, AnalyzerOptions, StringPosition, StringPositions, SymbolNames};
use crate::error::{Error, Result};
use crate::supervisor::{ChildGuard, Supervisor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

pub(crate) const PROTOCOL_VERSION: u8 = 1;

/// Requests the coordinator may send. Mutating kinds are queued and carry no
/// reply; fetch kinds answer with an ack frame plus one bulk frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    AnalyzePaths { paths: Vec<String> },
    SortPaths,
    AnalyzeStringLiterals {
        final_binary: PathBuf,
        ranges: Vec<AddressRange>,
    },
    FetchSymbolNames,
    FetchStringPositions,
}

/// Bulk replies to fetch requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    SymbolNames(SymbolNamesWire),
    StringPositions(StringPositionsWire),
}

/// `name -> paths` flattened into parallel arrays for the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolNamesWire {
    pub names: Vec<String>,
    /// Paths per name, aligned with `names`
    pub path_counts: Vec<u32>,
    /// All path lists, concatenated in `names` order
    pub paths: Vec<String>,
}

impl SymbolNamesWire {
    pub fn from_map(map: &SymbolNames) -> Self {
        let mut wire = Self::default();
        for (name, paths) in map {
            wire.names.push(name.clone());
            wire.path_counts.push(paths.len() as u32);
            wire.paths.extend(paths.iter().cloned());
        }
        wire
    }

    pub fn into_map(self) -> SymbolNames {
        let mut map = SymbolNames::new();
        let mut paths = self.paths.into_iter();
        for (name, count) in self.names.into_iter().zip(self.path_counts) {
            map.insert(name, paths.by_ref().take(count as usize).collect());
        }
        map
    }
}

/// Per-range, per-path positions flattened into parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringPositionsWire {
    pub ranges: Vec<AddressRange>,
    /// Path entries per range, aligned with `ranges`
    pub path_counts: Vec<u32>,
    /// All per-range path lists, concatenated
    pub paths: Vec<String>,
    /// Positions per path entry, aligned with `paths`
    pub position_counts: Vec<u32>,
    /// All positions, concatenated
    pub addresses: Vec<u64>,
    pub sizes: Vec<u64>,
}

impl StringPositionsWire {
    pub fn from_map(map: &StringPositions) -> Self {
        let mut wire = Self::default();
        // HashMap iteration order is arbitrary; emit ranges sorted so the
        // wire form of equal state is always byte-identical.
        let mut ranges: Vec<&AddressRange> = map.keys().collect();
        ranges.sort_unstable();
        for range in ranges {
            let by_path = &map[range];
            wire.ranges.push(*range);
            wire.path_counts.push(by_path.len() as u32);
            for (path, positions) in by_path {
                wire.paths.push(path.clone());
                wire.position_counts.push(positions.len() as u32);
                for position in positions {
                    wire.addresses.push(position.address);
                    wire.sizes.push(position.size);
                }
            }
        }
        wire
    }

    pub fn into_map(self) -> StringPositions {
        let mut map = StringPositions::new();
        let mut paths = self.paths.into_iter();
        let mut position_counts = self.position_counts.into_iter();
        let mut positions = self
            .addresses
            .into_iter()
            .zip(self.sizes)
            .map(|(address, size)| StringPosition { address, size });

        for (range, path_count) in self.ranges.into_iter().zip(self.path_counts) {
            let mut by_path = BTreeMap::new();
            for _ in 0..path_count {
                let (Some(path), Some(count)) = (paths.next(), position_counts.next()) else {
                    break;
                };
                by_path.insert(path, positions.by_ref().take(count as usize).collect());
            }
            map.insert(range, by_path);
        }
        map
    }
}

fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&[PROTOCOL_VERSION])?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 5];
    if let Err(e) = reader.read_exact(&mut header) {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Err(Error::TransportClosed),
            _ => Err(e.into()),
        };
    }
    if header[0] != PROTOCOL_VERSION {
        return Err(Error::Frame(format!(
            "unsupported protocol version {}",
            header[0]
        )));
    }
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut payload) {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Err(Error::TransportClosed),
            _ => Err(e.into()),
        };
    }
    Ok(payload)
}

fn send_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload)
}

fn recv_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let payload = read_frame(reader)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Caller-facing handle that runs the orchestrator in a delegate process.
///
/// Mutating calls return as soon as the request is queued in the delegate;
/// the fetch calls are the synchronization points.
pub struct Coordinator {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    _guard: ChildGuard,
    closed: bool,
}

impl Coordinator {
    /// Spawn the current executable as a delegate.
    pub fn spawn(options: &AnalyzerOptions, supervisor: &Arc<Supervisor>) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Self::spawn_with_exe(&exe, options, supervisor)
    }

    /// Spawn a specific executable as a delegate (used by tests).
    pub fn spawn_with_exe(
        exe: &Path,
        options: &AnalyzerOptions,
        supervisor: &Arc<Supervisor>,
    ) -> Result<Self> {
        let mut command = Command::new(exe);
        command
            .arg("--delegate")
            .arg("--tool-prefix")
            .arg(&options.tool_prefix)
            .arg("--batch-size")
            .arg(options.batch_size.to_string())
            .arg("--workers")
            .arg(options.workers.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if let Some(dir) = &options.output_directory {
            command.arg("--output-directory").arg(dir);
        }

        let mut child = command.spawn()?;
        let guard = supervisor.register(child.id());
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Frame("delegate has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Frame("delegate has no stdout".into()))?;
        tracing::debug!(pid = child.id(), "spawned delegate process");
        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stdout: BufReader::new(stdout),
            _guard: guard,
            closed: false,
        })
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(Error::TransportClosed)?;
        send_message(stdin, request)
    }

    /// Queue a path batch for analysis. Returns once the request is queued.
    pub fn analyze_paths(&mut self, paths: &[String]) -> Result<()> {
        self.send(&Request::AnalyzePaths {
            paths: paths.to_vec(),
        })
    }

    pub fn sort_paths(&mut self) -> Result<()> {
        self.send(&Request::SortPaths)
    }

    pub fn analyze_string_literals(
        &mut self,
        final_binary: &Path,
        ranges: &[AddressRange],
    ) -> Result<()> {
        self.send(&Request::AnalyzeStringLiterals {
            final_binary: final_binary.to_path_buf(),
            ranges: ranges.to_vec(),
        })
    }

    /// Expect the empty ack frame, then the bulk response frame.
    fn fetch(&mut self, request: Request) -> Result<Response> {
        self.send(&request)?;
        let queued_at = Instant::now();
        let ack = read_frame(&mut self.stdout)?;
        if !ack.is_empty() {
            return Err(Error::Frame("expected empty ack frame".into()));
        }
        let drained = queued_at.elapsed();
        let response = recv_message(&mut self.stdout)?;
        tracing::debug!(
            queue_ms = drained.as_millis() as u64,
            transfer_ms = (queued_at.elapsed() - drained).as_millis() as u64,
            "delegate fetch complete"
        );
        Ok(response)
    }

    /// Drain the delegate's queue and fetch the finalized name table.
    pub fn symbol_names(&mut self) -> Result<SymbolNames> {
        match self.fetch(Request::FetchSymbolNames)? {
            Response::SymbolNames(wire) => Ok(wire.into_map()),
            Response::StringPositions(_) => {
                Err(Error::Frame("mismatched response kind".into()))
            }
        }
    }

    /// Drain the delegate's queue and fetch all resolved string positions.
    pub fn string_positions(&mut self) -> Result<StringPositions> {
        match self.fetch(Request::FetchStringPositions)? {
            Response::StringPositions(wire) => Ok(wire.into_map()),
            Response::SymbolNames(_) => Err(Error::Frame("mismatched response kind".into())),
        }
    }

    /// Close stdin (the delegate treats EOF as normal shutdown) and reap.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stdin = None;
        let status = self.child.wait()?;
        tracing::debug!(code = status.code(), "delegate exited");
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Work items for the delegate's single background thread.
enum QueuedOp {
    AnalyzePaths(Vec<String>),
    SortPaths,
    AnalyzeStringLiterals(PathBuf, Vec<AddressRange>),
    FetchSymbolNames(crossbeam_channel::Sender<SymbolNamesWire>),
    FetchStringPositions(crossbeam_channel::Sender<StringPositionsWire>),
}

/// Run the delegate loop over stdin/stdout until the coordinator hangs up.
pub fn run_delegate(options: AnalyzerOptions) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(options, stdin.lock(), stdout.lock())
}

/// The delegate: a queue-feeding receive loop plus one worker thread that
/// owns the analyzer and serializes all mutations.
pub fn serve<R: Read, W: Write>(
    options: AnalyzerOptions,
    mut input: R,
    mut output: W,
) -> Result<()> {
    let analyzer = BulkAnalyzer::new(options)?;
    let (queue_tx, queue_rx) = crossbeam_channel::unbounded::<QueuedOp>();
    let worker = std::thread::Builder::new()
        .name("bulksym-delegate".into())
        .spawn(move || mutation_loop(analyzer, queue_rx))
        .map_err(Error::Io)?;

    loop {
        let request: Request = match recv_message(&mut input) {
            Ok(request) => request,
            // The owning caller exited; that's shutdown, not an error.
            Err(Error::TransportClosed) => break,
            Err(e) => {
                drop(queue_tx);
                let _ = worker.join();
                return Err(e);
            }
        };
        match request {
            Request::AnalyzePaths { paths } => {
                enqueue(&queue_tx, QueuedOp::AnalyzePaths(paths))?;
            }
            Request::SortPaths => {
                enqueue(&queue_tx, QueuedOp::SortPaths)?;
            }
            Request::AnalyzeStringLiterals {
                final_binary,
                ranges,
            } => {
                enqueue(
                    &queue_tx,
                    QueuedOp::AnalyzeStringLiterals(final_binary, ranges),
                )?;
            }
            Request::FetchSymbolNames => {
                let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
                enqueue(&queue_tx, QueuedOp::FetchSymbolNames(reply_tx))?;
                // FIFO order makes this a join of all prior mutations.
                let wire = reply_rx.recv().map_err(|_| Error::TransportClosed)?;
                write_frame(&mut output, &[])?;
                send_message(&mut output, &Response::SymbolNames(wire))?;
            }
            Request::FetchStringPositions => {
                let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
                enqueue(&queue_tx, QueuedOp::FetchStringPositions(reply_tx))?;
                let wire = reply_rx.recv().map_err(|_| Error::TransportClosed)?;
                write_frame(&mut output, &[])?;
                send_message(&mut output, &Response::StringPositions(wire))?;
            }
        }
    }

    drop(queue_tx);
    let _ = worker.join();
    Ok(())
}

fn enqueue(
    queue: &crossbeam_channel::Sender<QueuedOp>,
    op: QueuedOp,
) -> Result<()> {
    queue.send(op).map_err(|_| Error::TransportClosed)
}

/// Drains the FIFO; the only thread that ever touches the analyzer.
///
/// A failing mutation is logged and the loop continues with the next item;
/// one bad batch must not take the delegate down.
fn mutation_loop(mut analyzer: BulkAnalyzer, queue: crossbeam_channel::Receiver<QueuedOp>) {
    for op in queue {
        match op {
            QueuedOp::AnalyzePaths(paths) => {
                if let Err(e) = analyzer.analyze_paths(&paths) {
                    tracing::error!(error = %e, "queued analyze_paths failed");
                }
            }
            QueuedOp::SortPaths => {
                if let Err(e) = analyzer.sort_paths() {
                    tracing::error!(error = %e, "queued sort_paths failed");
                }
            }
            QueuedOp::AnalyzeStringLiterals(final_binary, ranges) => {
                if let Err(e) = analyzer.analyze_string_literals(&final_binary, &ranges) {
                    tracing::error!(error = %e, "queued string analysis failed");
                }
            }
            QueuedOp::FetchSymbolNames(reply) => {
                let _ = reply.send(SymbolNamesWire::from_map(analyzer.symbol_names()));
            }
            QueuedOp::FetchStringPositions(reply) => {
                let _ = reply.send(StringPositionsWire::from_map(analyzer.string_positions()));
            }
        }
    }
    analyzer.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"hello").unwrap();
        write_frame(&mut buffer, b"").unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"");
        assert!(matches!(
            read_frame(&mut cursor).unwrap_err(),
            Error::TransportClosed
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"x").unwrap();
        buffer[0] = 99;
        let mut cursor = std::io::Cursor::new(buffer);
        assert!(matches!(
            read_frame(&mut cursor).unwrap_err(),
            Error::Frame(_)
        ));
    }

    #[test]
    fn test_symbol_names_wire_round_trip() {
        let mut map = SymbolNames::new();
        map.insert("foo()".into(), vec!["a.o".into(), "b.o".into()]);
        map.insert("bar".into(), vec!["c.o".into()]);
        map.insert("empty".into(), vec![]);
        let wire = SymbolNamesWire::from_map(&map);
        assert_eq!(wire.names.len(), 3);
        assert_eq!(wire.paths.len(), 3);
        assert_eq!(wire.into_map(), map);
    }

    #[test]
    fn test_string_positions_wire_round_trip() {
        let mut map = StringPositions::new();
        let range_a = AddressRange::new(0x1000, 0x100);
        let range_b = AddressRange::new(0x4000, 0x40);
        let mut by_path = BTreeMap::new();
        by_path.insert(
            "a.o".to_string(),
            vec![
                StringPosition {
                    address: 0x1004,
                    size: 3,
                },
                StringPosition {
                    address: 0x1010,
                    size: 8,
                },
            ],
        );
        map.insert(range_a, by_path);
        map.insert(range_b, BTreeMap::new());

        let wire = StringPositionsWire::from_map(&map);
        assert_eq!(wire.ranges, vec![range_a, range_b]);
        assert_eq!(wire.addresses, vec![0x1004, 0x1010]);
        assert_eq!(wire.into_map(), map);
    }

    #[test]
    fn test_request_tags_survive_serde() {
        let request = Request::AnalyzeStringLiterals {
            final_binary: PathBuf::from("/tmp/final"),
            ranges: vec![AddressRange::new(1, 2)],
        };
        let json = serde_json::to_vec(&request).unwrap();
        let back: Request = serde_json::from_slice(&json).unwrap();
        assert!(matches!(
            back,
            Request::AnalyzeStringLiterals { ranges, .. } if ranges.len() == 1
        ));
    }
}
