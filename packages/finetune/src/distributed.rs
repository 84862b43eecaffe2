//! Process topology and the collectives the training loop relies on.
//!
//! Every collective must be entered by every rank in the same order. A rank
//! that skips one leaves its peers blocked in the matching call; without a
//! configured timeout they wait forever. An in-process group can instead be
//! aborted by the failing rank, which releases every waiting peer.

use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::autograd::Tape;

const OP_HELLO: u32 = 1;
const OP_ALL_REDUCE: u32 = 2;
const OP_BARRIER: u32 = 3;
const OP_BROADCAST: u32 = 4;

const CONNECT_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("connecting to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("accepting peer on {addr}: {source}")]
    Accept {
        addr: String,
        source: std::io::Error,
    },
    #[error("link to rank {peer}: {source}")]
    Io {
        peer: usize,
        source: std::io::Error,
    },
    #[error("collective protocol: {0}")]
    Protocol(String),
    #[error("process group aborted after rank {rank} failed")]
    Aborted { rank: usize },
}

/// Where this worker sits in the run. Fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessTopology {
    pub nodes: usize,
    pub devices_per_node: usize,
    pub node_index: usize,
    pub local_rank: usize,
}

impl ProcessTopology {
    pub fn global_rank(&self) -> usize {
        self.node_index * self.devices_per_node + self.local_rank
    }

    pub fn world_size(&self) -> usize {
        self.nodes * self.devices_per_node
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    pub fn is_coordinator(&self) -> bool {
        self.global_rank() == 0
    }
}

/// Rendezvous settings, passed explicitly instead of through the environment.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorConfig {
    pub address: String,
    pub port: u16,
    pub rank: usize,
    pub world_size: usize,
    /// Read timeout on collective links. `None` blocks indefinitely.
    pub timeout: Option<Duration>,
    /// How long a non-zero rank keeps retrying the initial connection.
    pub connect_timeout: Duration,
}

impl CoordinatorConfig {
    pub fn new(address: impl Into<String>, port: u16, rank: usize, world_size: usize) -> Self {
        Self {
            address: address.into(),
            port,
            rank,
            world_size,
            timeout: None,
            connect_timeout: Duration::from_secs(300),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// The collectives the training loop needs, nothing more.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Returns once every rank has entered the barrier.
    fn barrier(&self) -> Result<(), CollectiveError>;

    /// Replaces `values` with the element-wise mean across ranks.
    fn all_reduce_mean(&self, values: &mut [f64]) -> Result<(), CollectiveError>;

    /// Replaces `values` on every rank with rank 0's copy.
    fn broadcast(&self, values: &mut [f64]) -> Result<(), CollectiveError>;
}

/// Star-shaped TCP group: rank 0 holds one link per peer and does the
/// reduction; every other rank holds a single link to rank 0.
#[derive(Debug)]
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    links: Mutex<Vec<TcpStream>>,
}

impl TcpProcessGroup {
    pub fn setup(config: &CoordinatorConfig) -> Result<Self, CollectiveError> {
        if config.rank >= config.world_size {
            return Err(CollectiveError::Protocol(format!(
                "rank {} out of range for world size {}",
                config.rank, config.world_size
            )));
        }
        if config.rank == 0 {
            let addr = config.addr();
            let listener = TcpListener::bind(&addr)
                .map_err(|source| CollectiveError::Bind { addr, source })?;
            Self::host(listener, config)
        } else {
            Self::join(config)
        }
    }

    /// Rank 0 side: accept `world_size - 1` peers on an already bound listener.
    pub fn host(
        listener: TcpListener,
        config: &CoordinatorConfig,
    ) -> Result<Self, CollectiveError> {
        let peers = config.world_size - 1;
        let mut slots: Vec<Option<TcpStream>> = (0..peers).map(|_| None).collect();
        info!(
            addr = %config.addr(),
            world_size = config.world_size,
            "waiting for peers"
        );

        for _ in 0..peers {
            let (mut stream, remote) =
                listener.accept().map_err(|source| CollectiveError::Accept {
                    addr: config.addr(),
                    source,
                })?;
            let peer = read_hello(&mut stream, remote, config.timeout)?;
            if peer == 0 || peer >= config.world_size {
                return Err(CollectiveError::Protocol(format!(
                    "peer {remote} announced invalid rank {peer}"
                )));
            }
            let slot = &mut slots[peer - 1];
            if slot.is_some() {
                return Err(CollectiveError::Protocol(format!(
                    "rank {peer} joined twice"
                )));
            }
            configure(&stream, config.timeout, peer)?;
            debug!(peer, %remote, "peer joined");
            *slot = Some(stream);
        }

        let links = slots.into_iter().flatten().collect();
        info!(rank = 0, world_size = config.world_size, "process group ready");
        Ok(Self {
            rank: 0,
            world_size: config.world_size,
            links: Mutex::new(links),
        })
    }

    fn join(config: &CoordinatorConfig) -> Result<Self, CollectiveError> {
        let addr = config.addr();
        let deadline = Instant::now() + config.connect_timeout;
        let mut stream = loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => break stream,
                Err(source) if Instant::now() >= deadline => {
                    return Err(CollectiveError::Connect { addr, source });
                }
                Err(_) => thread::sleep(CONNECT_RETRY),
            }
        };
        configure(&stream, config.timeout, 0)?;
        send_frame(&mut stream, 0, OP_HELLO, &[config.rank as f64])?;
        info!(rank = config.rank, world_size = config.world_size, "process group ready");
        Ok(Self {
            rank: config.rank,
            world_size: config.world_size,
            links: Mutex::new(vec![stream]),
        })
    }

    /// Closes every link. Consumes the group so no collective can follow.
    pub fn teardown(self) -> Result<(), CollectiveError> {
        let links = self.links.into_inner().unwrap_or_else(PoisonError::into_inner);
        for (i, link) in links.iter().enumerate() {
            let peer = if self.rank == 0 { i + 1 } else { 0 };
            match link.shutdown(Shutdown::Both) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotConnected => {}
                Err(source) => return Err(CollectiveError::Io { peer, source }),
            }
        }
        info!(rank = self.rank, "process group destroyed");
        Ok(())
    }

    fn links(&self) -> MutexGuard<'_, Vec<TcpStream>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gather to rank 0, optionally average, scatter the result back.
    fn exchange(&self, op: u32, values: &mut [f64], reduce: bool) -> Result<(), CollectiveError> {
        let mut links = self.links();
        if self.rank == 0 {
            let mut acc = values.to_vec();
            for (i, link) in links.iter_mut().enumerate() {
                let incoming = recv_frame(link, i + 1, op, Some(values.len()))?;
                if reduce {
                    for (a, v) in acc.iter_mut().zip(incoming) {
                        *a += v;
                    }
                }
            }
            if reduce {
                let n = self.world_size as f64;
                for a in &mut acc {
                    *a /= n;
                }
            }
            for (i, link) in links.iter_mut().enumerate() {
                send_frame(link, i + 1, op, &acc)?;
            }
            values.copy_from_slice(&acc);
        } else {
            let link = &mut links[0];
            send_frame(link, 0, op, values)?;
            let result = recv_frame(link, 0, op, Some(values.len()))?;
            values.copy_from_slice(&result);
        }
        Ok(())
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.exchange(OP_BARRIER, &mut [], false)
    }

    fn all_reduce_mean(&self, values: &mut [f64]) -> Result<(), CollectiveError> {
        self.exchange(OP_ALL_REDUCE, values, true)
    }

    fn broadcast(&self, values: &mut [f64]) -> Result<(), CollectiveError> {
        let mut links = self.links();
        if self.rank == 0 {
            for (i, link) in links.iter_mut().enumerate() {
                send_frame(link, i + 1, OP_BROADCAST, values)?;
            }
        } else {
            let result = recv_frame(&mut links[0], 0, OP_BROADCAST, Some(values.len()))?;
            values.copy_from_slice(&result);
        }
        Ok(())
    }
}

fn configure(
    stream: &TcpStream,
    timeout: Option<Duration>,
    peer: usize,
) -> Result<(), CollectiveError> {
    let io = |source| CollectiveError::Io { peer, source };
    stream.set_nodelay(true).map_err(io)?;
    stream.set_read_timeout(timeout).map_err(io)?;
    Ok(())
}

/// Reads the joining rank's announcement before its rank is known, so
/// failures are attributed to the remote address.
fn read_hello(
    stream: &mut TcpStream,
    remote: SocketAddr,
    timeout: Option<Duration>,
) -> Result<usize, CollectiveError> {
    let accept = |source| CollectiveError::Accept {
        addr: remote.to_string(),
        source,
    };
    stream.set_read_timeout(timeout).map_err(accept)?;
    let mut frame = [0_u8; 20];
    stream.read_exact(&mut frame).map_err(accept)?;
    let op = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let mut len_bytes = [0_u8; 8];
    len_bytes.copy_from_slice(&frame[4..12]);
    if op != OP_HELLO || u64::from_le_bytes(len_bytes) != 1 {
        return Err(CollectiveError::Protocol(format!(
            "{remote} opened with op {op} instead of a hello"
        )));
    }
    let mut rank_bytes = [0_u8; 8];
    rank_bytes.copy_from_slice(&frame[12..20]);
    Ok(f64::from_le_bytes(rank_bytes) as usize)
}

fn send_frame(
    stream: &mut TcpStream,
    peer: usize,
    op: u32,
    data: &[f64],
) -> Result<(), CollectiveError> {
    let mut buf = Vec::with_capacity(12 + data.len() * 8);
    buf.extend_from_slice(&op.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
    for v in data {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    stream
        .write_all(&buf)
        .and_then(|()| stream.flush())
        .map_err(|source| CollectiveError::Io { peer, source })
}

fn recv_frame(
    stream: &mut TcpStream,
    peer: usize,
    expected_op: u32,
    expected_len: Option<usize>,
) -> Result<Vec<f64>, CollectiveError> {
    let io = |source| CollectiveError::Io { peer, source };
    let mut header = [0_u8; 12];
    stream.read_exact(&mut header).map_err(io)?;
    let op = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let mut len_bytes = [0_u8; 8];
    len_bytes.copy_from_slice(&header[4..12]);
    let len = u64::from_le_bytes(len_bytes) as usize;

    if op != expected_op {
        return Err(CollectiveError::Protocol(format!(
            "rank {peer} sent op {op} while op {expected_op} was expected"
        )));
    }
    if let Some(expected) = expected_len {
        if len != expected {
            return Err(CollectiveError::Protocol(format!(
                "rank {peer} sent {len} values, expected {expected}"
            )));
        }
    }

    let mut payload = vec![0_u8; len * 8];
    stream.read_exact(&mut payload).map_err(io)?;
    Ok(payload
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted_by: Option<usize>,
}

#[derive(Debug)]
struct LocalShared {
    slots: Mutex<Vec<Vec<f64>>>,
    state: Mutex<BarrierState>,
    released: Condvar,
}

/// In-process group for ranks running as threads of one process.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<LocalShared>,
}

impl LocalProcessGroup {
    /// One handle per rank; hand each to its own thread.
    pub fn group(world_size: usize) -> Vec<Self> {
        assert!(world_size > 0, "world_size must be > 0");
        let shared = Arc::new(LocalShared {
            slots: Mutex::new(vec![Vec::new(); world_size]),
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    /// Fails every pending and future collective on all ranks of the group.
    /// Only the first abort is recorded.
    pub fn abort(&self) {
        let mut state = self.state();
        if state.aborted_by.is_none() {
            state.aborted_by = Some(self.rank);
            info!(rank = self.rank, "process group aborted");
        }
        self.shared.released.notify_all();
    }

    /// The rank whose failure aborted the group, if any.
    pub fn aborted_by(&self) -> Option<usize> {
        self.state().aborted_by
    }

    fn state(&self) -> MutexGuard<'_, BarrierState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Vec<f64>>> {
        self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self) -> Result<(), CollectiveError> {
        let mut state = self.state();
        if let Some(rank) = state.aborted_by {
            return Err(CollectiveError::Aborted { rank });
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.shared.released.notify_all();
            return Ok(());
        }
        while state.generation == generation {
            if let Some(rank) = state.aborted_by {
                return Err(CollectiveError::Aborted { rank });
            }
            state = self
                .shared
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.wait()
    }

    fn all_reduce_mean(&self, values: &mut [f64]) -> Result<(), CollectiveError> {
        self.slots()[self.rank] = values.to_vec();
        self.wait()?;
        let result = {
            let slots = self.slots();
            if slots.iter().any(|s| s.len() != values.len()) {
                return Err(CollectiveError::Protocol(
                    "ranks contributed buffers of different lengths".to_string(),
                ));
            }
            let n = self.world_size as f64;
            (0..values.len())
                .map(|i| slots.iter().map(|s| s[i]).sum::<f64>() / n)
                .collect::<Vec<_>>()
        };
        self.wait()?;
        values.copy_from_slice(&result);
        Ok(())
    }

    fn broadcast(&self, values: &mut [f64]) -> Result<(), CollectiveError> {
        if self.rank == 0 {
            self.slots()[0] = values.to_vec();
        }
        self.wait()?;
        if self.rank != 0 {
            let slots = self.slots();
            if slots[0].len() != values.len() {
                return Err(CollectiveError::Protocol(format!(
                    "broadcast of {} values into buffer of {}",
                    slots[0].len(),
                    values.len()
                )));
            }
            values.copy_from_slice(&slots[0]);
        }
        self.wait()?;
        Ok(())
    }
}

/// Averages a scalar across ranks.
pub fn all_reduce_average(group: &dyn ProcessGroup, value: f64) -> Result<f64, CollectiveError> {
    let mut buf = [value];
    group.all_reduce_mean(&mut buf)?;
    Ok(buf[0])
}

/// Makes every replica start from rank 0's weights.
pub fn broadcast_parameters(
    tape: &mut Tape,
    group: &dyn ProcessGroup,
) -> Result<(), CollectiveError> {
    let mut flat = tape
        .params()
        .iter()
        .flat_map(|p| p.data.iter().copied())
        .collect::<Vec<_>>();
    group.broadcast(&mut flat)?;
    let mut offset = 0;
    for param in tape.params_mut() {
        let n = param.data.len();
        param.data.copy_from_slice(&flat[offset..offset + n]);
        offset += n;
    }
    Ok(())
}

/// Averages accumulated gradients across replicas in a single all-reduce.
pub fn sync_gradients(tape: &mut Tape, group: &dyn ProcessGroup) -> Result<(), CollectiveError> {
    let mut flat = tape
        .params()
        .iter()
        .flat_map(|p| p.grad.iter().copied())
        .collect::<Vec<_>>();
    group.all_reduce_mean(&mut flat)?;
    let mut offset = 0;
    for param in tape.params_mut() {
        let n = param.grad.len();
        param.grad.copy_from_slice(&flat[offset..offset + n]);
        offset += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Param;

    fn run_ranks<G, T, F>(groups: Vec<G>, body: F) -> Vec<T>
    where
        G: ProcessGroup + 'static,
        T: Send + 'static,
        F: Fn(G) -> T + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        let handles = groups
            .into_iter()
            .map(|g| {
                let body = body.clone();
                thread::spawn(move || (*body)(g))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    }

    fn tcp_group(world_size: usize) -> Vec<TcpProcessGroup> {
        tcp_group_with_timeout(world_size, None)
    }

    fn tcp_group_with_timeout(
        world_size: usize,
        timeout: Option<Duration>,
    ) -> Vec<TcpProcessGroup> {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let mut handles = Vec::new();
        for rank in 1..world_size {
            let config = CoordinatorConfig::new("127.0.0.1", port, rank, world_size);
            handles.push(thread::spawn(move || TcpProcessGroup::setup(&config)));
        }
        let mut root_config = CoordinatorConfig::new("127.0.0.1", port, 0, world_size);
        root_config.timeout = timeout;
        let mut groups = vec![TcpProcessGroup::host(listener, &root_config).expect("host")];
        for handle in handles {
            groups.push(handle.join().expect("join").expect("setup"));
        }
        groups
    }

    #[test]
    fn topology_global_rank() {
        let topology = ProcessTopology {
            nodes: 2,
            devices_per_node: 4,
            node_index: 1,
            local_rank: 2,
        };
        assert_eq!(topology.global_rank(), 6);
        assert_eq!(topology.world_size(), 8);
        assert!(!topology.is_coordinator());
        assert!(topology.is_distributed());
    }

    #[test]
    fn local_all_reduce_is_unweighted_mean() {
        let results = run_ranks(LocalProcessGroup::group(4), |g| {
            all_reduce_average(&g, g.rank() as f64).expect("all_reduce")
        });
        assert_eq!(results, vec![1.5; 4]);
    }

    #[test]
    fn local_broadcast_copies_rank_zero() {
        let results = run_ranks(LocalProcessGroup::group(3), |g| {
            let mut values = vec![g.rank() as f64 + 10.0; 2];
            g.broadcast(&mut values).expect("broadcast");
            g.barrier().expect("barrier");
            values
        });
        assert!(results.iter().all(|v| v == &vec![10.0, 10.0]));
    }

    #[test]
    fn tcp_collectives_agree_across_ranks() {
        let results = run_ranks(tcp_group(3), |g| {
            let mut values = vec![g.rank() as f64, 3.0];
            g.all_reduce_mean(&mut values).expect("all_reduce");
            g.barrier().expect("barrier");
            let mut weights = vec![g.rank() as f64; 3];
            g.broadcast(&mut weights).expect("broadcast");
            g.teardown().expect("teardown");
            (values, weights)
        });
        for (values, weights) in results {
            assert_eq!(values, vec![1.0, 3.0]);
            assert_eq!(weights, vec![0.0; 3]);
        }
    }

    #[test]
    fn tcp_mismatched_collectives_are_reported() {
        let results = run_ranks(tcp_group(2), |g| {
            if g.rank() == 0 {
                g.all_reduce_mean(&mut [1.0, 2.0])
            } else {
                g.barrier()
            }
        });
        assert!(matches!(results[0], Err(CollectiveError::Protocol(_))));
        assert!(results[1].is_err());
    }

    #[test]
    fn tcp_timeout_turns_a_silent_peer_into_an_io_error() {
        let timeout = Duration::from_millis(200);
        let results = run_ranks(tcp_group_with_timeout(2, Some(timeout)), |g| {
            if g.rank() == 0 {
                let started = Instant::now();
                let result = g.barrier();
                (result, started.elapsed())
            } else {
                thread::sleep(Duration::from_millis(1500));
                (Ok(()), Duration::ZERO)
            }
        });
        let (result, elapsed) = &results[0];
        match result {
            Err(CollectiveError::Io { peer, source }) => {
                assert_eq!(*peer, 1);
                assert!(
                    matches!(
                        source.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ),
                    "{source:?}"
                );
            }
            other => panic!("expected a timed-out link, got {other:?}"),
        }
        assert!(*elapsed < Duration::from_millis(1500), "{elapsed:?}");
    }

    #[test]
    fn tcp_host_rejects_a_peer_that_skips_the_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let intruder = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
            send_frame(&mut stream, 0, OP_BARRIER, &[0.0]).expect("send");
            stream
        });
        let config = CoordinatorConfig::new("127.0.0.1", port, 0, 2);
        let err = TcpProcessGroup::host(listener, &config).expect_err("bad hello");
        assert!(matches!(err, CollectiveError::Protocol(_)), "{err:?}");
        drop(intruder.join().expect("intruder"));
    }

    #[test]
    fn local_abort_releases_ranks_blocked_in_a_collective() {
        let groups = LocalProcessGroup::group(3);
        let observer = groups[0].clone();
        let results = run_ranks(groups, |g| {
            if g.rank() == 0 {
                g.abort();
                Err(CollectiveError::Aborted { rank: 0 })
            } else {
                let mut values = [g.rank() as f64];
                g.all_reduce_mean(&mut values)
            }
        });
        for result in &results[1..] {
            assert!(
                matches!(result, Err(CollectiveError::Aborted { rank: 0 })),
                "{result:?}"
            );
        }
        assert_eq!(observer.aborted_by(), Some(0));
        assert!(matches!(
            observer.barrier(),
            Err(CollectiveError::Aborted { rank: 0 })
        ));
    }

    #[test]
    fn local_abort_keeps_the_first_failing_rank() {
        let groups = LocalProcessGroup::group(2);
        groups[1].abort();
        groups[0].abort();
        assert_eq!(groups[0].aborted_by(), Some(1));
    }

    #[test]
    fn sync_gradients_averages_each_parameter() {
        let results = run_ranks(LocalProcessGroup::group(2), |g| {
            let mut tape = Tape::new();
            let w = tape.add_param(Param::zeros(1, 2));
            let b = tape.add_param(Param::zeros(1, 1));
            let r = g.rank() as f64;
            tape.params_mut()[w].grad.copy_from_slice(&[r, 2.0 * r]);
            tape.params_mut()[b].grad[0] = 4.0 * r;
            sync_gradients(&mut tape, &g).expect("sync");
            (tape.params()[w].grad.clone(), tape.params()[b].grad.clone())
        });
        for (w, b) in results {
            assert_eq!(w, vec![0.5, 1.0]);
            assert_eq!(b, vec![2.0]);
        }
    }

    #[test]
    fn broadcast_parameters_aligns_replicas() {
        let results = run_ranks(LocalProcessGroup::group(2), |g| {
            let mut tape = Tape::new();
            let w = tape.add_param(Param::zeros(2, 2));
            tape.params_mut()[w].data.fill(g.rank() as f64 + 1.0);
            broadcast_parameters(&mut tape, &g).expect("broadcast");
            tape.params()[w].data.clone()
        });
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], vec![1.0; 4]);
    }
}
