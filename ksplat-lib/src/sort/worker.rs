use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use glam::Mat4;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::SplatError;
use crate::sort::engine::{SortEngine, SortEngineConfig, SortParams};
use crate::sort::transport::{ArenaLayout, SharedSortArena, SortPayload, SortTransport, SortedIndexes, TransportMode};

pub const SORT_THREAD_NAME: &str = "ksplat-sort";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortWorkerConfig {
    pub transport: TransportMode,
    pub engine: SortEngineConfig,
    pub channel_capacity: usize,
}

impl Default for SortWorkerConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::Copy,
            engine: SortEngineConfig::default(),
            channel_capacity: 4,
        }
    }
}

#[derive(Debug)]
pub enum WorkerRequest {
    Init {
        splat_count: usize,
        config: SortEngineConfig,
        transport: SortTransport,
        layout: Option<ArenaLayout>,
        reply: oneshot::Sender<Result<(), SplatError>>,
    },
    Data {
        centers: Vec<f32>,
        transform_indexes: Vec<u32>,
    },
    Transforms {
        transforms: Vec<Mat4>,
    },
    Sort {
        generation: u64,
        /// Shared result half to write.
        half: usize,
        params: SortParams,
        payload: SortPayload,
        reply: oneshot::Sender<Result<SortOutcome, SplatError>>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SortOutcome {
    pub generation: u64,
    pub splat_render_count: usize,
    pub sorted: SortedIndexes,
    /// Time spent inside the worker.
    pub sort_time: Duration,
}

#[derive(Debug)]
pub enum SortPoll {
    /// Nothing was requested.
    Idle,
    Pending,
    Done(SortOutcome),
    /// The result of this generation arrived after [`SortWorker::invalidate`]
    /// and was dropped.
    Stale(u64),
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    half: usize,
    reply: oneshot::Receiver<Result<SortOutcome, SplatError>>,
}

/// Depth sorter running on its own thread. At most one sort is in flight;
/// results come back through [`Self::poll`], [`Self::wait`] or
/// [`Self::finish`].
///
/// In shared mode each sort writes the result half the last delivered result
/// does not use, so a [`SortedIndexes::Shared`] stays valid until a newer
/// [`SortPoll::Done`] arrives. Failed and stale sorts never reach it.
#[derive(Debug)]
pub struct SortWorker {
    sender: Option<mpsc::Sender<WorkerRequest>>,
    handle: Option<JoinHandle<()>>,
    transport: SortTransport,
    splat_count: usize,
    config: SortWorkerConfig,
    generation: u64,
    in_flight: Option<InFlight>,
    /// Half holding the last delivered shared result.
    applied_half: Option<usize>,
    ready: Option<oneshot::Receiver<Result<(), SplatError>>>,
}

impl SortWorker {
    /// Starts the worker thread and queues the init handshake. Does not block,
    /// so it may be called from async code.
    pub fn spawn(splat_count: usize, config: SortWorkerConfig) -> Result<Self, SplatError> {
        config.engine.validate()?;
        if config.channel_capacity == 0 {
            return Err(SplatError::InvalidSortRequest(
                "channel capacity must be positive".to_string(),
            ));
        }
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let handle = thread::Builder::new()
            .name(SORT_THREAD_NAME.to_string())
            .spawn(move || worker_loop(receiver))?;

        let transport = SortTransport::new(config.transport, splat_count);
        let (reply, ready) = oneshot::channel();
        let mut worker = Self {
            sender: Some(sender),
            handle: Some(handle),
            transport: transport.clone(),
            splat_count,
            config,
            generation: 0,
            in_flight: None,
            applied_half: None,
            ready: Some(ready),
        };
        worker.send(WorkerRequest::Init {
            splat_count,
            config: config.engine,
            layout: transport.layout(),
            transport,
            reply,
        })?;
        tracing::info!(splat_count, transport = ?config.transport, "spawned sort worker");
        Ok(worker)
    }

    pub fn config(&self) -> &SortWorkerConfig {
        &self.config
    }

    pub fn splat_count(&self) -> usize {
        self.splat_count
    }

    /// Shared arena in [`TransportMode::Shared`].
    pub fn arena(&self) -> Option<&std::sync::Arc<SharedSortArena>> {
        self.transport.arena()
    }

    /// Current request generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// `Ok(true)` once the worker has acknowledged the init handshake.
    pub fn is_ready(&mut self) -> Result<bool, SplatError> {
        let Some(ready) = self.ready.as_mut() else {
            return Ok(true);
        };
        match ready.try_recv() {
            Ok(result) => {
                self.ready = None;
                result.map(|_| true)
            }
            Err(oneshot::error::TryRecvError::Empty) => Ok(false),
            Err(oneshot::error::TryRecvError::Closed) => {
                self.ready = None;
                Err(SplatError::WorkerDisconnected)
            }
        }
    }

    fn send(&mut self, request: WorkerRequest) -> Result<(), SplatError> {
        let sender = self.sender.as_ref().ok_or(SplatError::WorkerDisconnected)?;
        sender.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => SplatError::WorkerQueueFull,
            TrySendError::Closed(_) => SplatError::WorkerDisconnected,
        })
    }

    pub fn set_data(&mut self, centers: Vec<f32>, transform_indexes: Vec<u32>) -> Result<(), SplatError> {
        if centers.len() != self.splat_count * 3 {
            return Err(SplatError::MismatchedArrays(format!(
                "{} center floats for {} splats",
                centers.len(),
                self.splat_count
            )));
        }
        self.send(WorkerRequest::Data {
            centers,
            transform_indexes,
        })
    }

    pub fn set_transforms(&mut self, transforms: Vec<Mat4>) -> Result<(), SplatError> {
        self.send(WorkerRequest::Transforms { transforms })
    }

    /// Queues a sort of `candidates`. Returns the request generation, or
    /// [`SplatError::SortInFlight`] while an earlier sort is outstanding.
    pub fn request_sort(
        &mut self,
        params: SortParams,
        candidates: &[u32],
        precomputed: Option<&[f32]>,
    ) -> Result<u64, SplatError> {
        self.check_idle()?;
        params.validate(candidates.len(), precomputed.map(<[f32]>::len))?;
        let payload = self.transport.stage(candidates, precomputed)?;
        self.dispatch(params, payload)
    }

    /// Shared transport only: sorts the first `candidate_count` entries the
    /// caller already wrote through [`SharedSortArena::candidates_mut`].
    pub fn request_staged_sort(
        &mut self,
        params: SortParams,
        candidate_count: usize,
        precomputed: bool,
    ) -> Result<u64, SplatError> {
        self.check_idle()?;
        let Some(arena) = self.transport.arena() else {
            return Err(SplatError::InvalidSortRequest(
                "staged sorts need the shared transport".to_string(),
            ));
        };
        if candidate_count > arena.layout().capacity {
            return Err(SplatError::InvalidSortRequest(format!(
                "{} candidates exceed the shared arena capacity {}",
                candidate_count,
                arena.layout().capacity
            )));
        }
        params.validate(candidate_count, precomputed.then_some(candidate_count))?;
        self.dispatch(
            params,
            SortPayload::Shared {
                candidate_count,
                precomputed,
            },
        )
    }

    fn check_idle(&self) -> Result<(), SplatError> {
        match &self.in_flight {
            Some(in_flight) => Err(SplatError::SortInFlight(in_flight.generation)),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, params: SortParams, payload: SortPayload) -> Result<u64, SplatError> {
        let generation = self.generation + 1;
        let half = self.applied_half.map_or(0, |h| h ^ 1);
        let (reply, receiver) = oneshot::channel();
        self.send(WorkerRequest::Sort {
            generation,
            half,
            params,
            payload,
            reply,
        })?;
        self.generation = generation;
        self.in_flight = Some(InFlight {
            generation,
            half,
            reply: receiver,
        });
        Ok(generation)
    }

    /// Marks the outstanding sort, if any, as superseded. Its result will be
    /// reported as [`SortPoll::Stale`].
    pub fn invalidate(&mut self) {
        self.generation += 1;
    }

    fn complete(
        &mut self,
        half: usize,
        received: Result<Result<SortOutcome, SplatError>, ()>,
    ) -> Result<SortPoll, SplatError> {
        self.in_flight = None;
        let outcome = received.map_err(|_| SplatError::WorkerDisconnected)??;
        if outcome.generation != self.generation {
            tracing::debug!(
                stale = outcome.generation,
                current = self.generation,
                "dropping stale sort result"
            );
            return Ok(SortPoll::Stale(outcome.generation));
        }
        if matches!(outcome.sorted, SortedIndexes::Shared { .. }) {
            self.applied_half = Some(half);
        }
        Ok(SortPoll::Done(outcome))
    }

    /// Non-blocking check for the in-flight result.
    pub fn poll(&mut self) -> Result<SortPoll, SplatError> {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return Ok(SortPoll::Idle);
        };
        let half = in_flight.half;
        match in_flight.reply.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => Ok(SortPoll::Pending),
            Err(oneshot::error::TryRecvError::Closed) => self.complete(half, Err(())),
            Ok(result) => self.complete(half, Ok(result)),
        }
    }

    /// Blocks until the in-flight sort finishes. Must not be called from
    /// inside an async runtime; use [`Self::finish`] there.
    pub fn wait(&mut self) -> Result<SortPoll, SplatError> {
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(SortPoll::Idle);
        };
        let received = in_flight.reply.blocking_recv().map_err(|_| ());
        self.complete(in_flight.half, received)
    }

    pub async fn finish(&mut self) -> Result<SortPoll, SplatError> {
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(SortPoll::Idle);
        };
        let received = in_flight.reply.await.map_err(|_| ());
        self.complete(in_flight.half, received)
    }

    /// Stops the worker and waits for its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.try_send(WorkerRequest::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("sort worker thread panicked");
            }
        }
    }
}

impl Drop for SortWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerState {
    engine: SortEngine,
    transport: SortTransport,
    /// Reported by the next sort if priming data was rejected.
    data_error: Option<SplatError>,
}

fn init_state(
    splat_count: usize,
    config: SortEngineConfig,
    transport: SortTransport,
    layout: Option<ArenaLayout>,
) -> Result<WorkerState, SplatError> {
    if layout != transport.layout() {
        return Err(SplatError::InvalidSortRequest(
            "arena layout does not match the shared arena".to_string(),
        ));
    }
    if let Some(layout) = &layout {
        if layout.capacity < splat_count {
            return Err(SplatError::InvalidSortRequest(format!(
                "arena holds {} candidates, scene has {} splats",
                layout.capacity, splat_count
            )));
        }
    }
    Ok(WorkerState {
        engine: SortEngine::new(splat_count, config)?,
        transport,
        data_error: None,
    })
}

fn worker_loop(mut receiver: mpsc::Receiver<WorkerRequest>) {
    let mut state: Option<WorkerState> = None;

    while let Some(request) = receiver.blocking_recv() {
        match request {
            WorkerRequest::Init {
                splat_count,
                config,
                transport,
                layout,
                reply,
            } => {
                let result = init_state(splat_count, config, transport, layout).map(|s| {
                    state = Some(s);
                });
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "sort worker init failed");
                }
                let _ = reply.send(result);
            }
            WorkerRequest::Data {
                centers,
                transform_indexes,
            } => {
                if let Some(state) = state.as_mut() {
                    if let Err(e) = state.engine.set_data(centers, transform_indexes) {
                        tracing::warn!(error = %e, "rejected sort data");
                        state.data_error = Some(e);
                    } else {
                        state.data_error = None;
                    }
                }
            }
            WorkerRequest::Transforms { transforms } => {
                if let Some(state) = state.as_mut() {
                    state.engine.set_transforms(transforms);
                }
            }
            WorkerRequest::Sort {
                generation,
                half,
                params,
                payload,
                reply,
            } => {
                let started = Instant::now();
                let result = match state.as_mut() {
                    None => Err(SplatError::InvalidSortRequest(
                        "sort worker is not initialized".to_string(),
                    )),
                    Some(state) => match state.data_error.take() {
                        Some(e) => Err(e),
                        None => state.transport.execute(&mut state.engine, &params, payload, half),
                    },
                };
                let result = result.map(|sorted| SortOutcome {
                    generation,
                    splat_render_count: sorted.len(),
                    sorted,
                    sort_time: started.elapsed(),
                });
                match &result {
                    Ok(outcome) => tracing::debug!(
                        generation,
                        sorted = params.splat_sort_count,
                        rendered = outcome.splat_render_count,
                        elapsed = ?outcome.sort_time,
                        "sort done"
                    ),
                    Err(e) => tracing::warn!(generation, error = %e, "sort failed"),
                }
                let _ = reply.send(result);
            }
            WorkerRequest::Shutdown => break,
        }
    }
    tracing::info!("sort worker stopped");
}
