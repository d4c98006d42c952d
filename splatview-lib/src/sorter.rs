//! View-dependent ordering of splats, run on a dedicated worker thread.
//!
//! The main thread never shares memory with the worker: every request and response is moved
//! through a channel. The worker drains its queue before doing any work, so a burst of camera
//! updates or growing buffers collapses into a single sort against the newest state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use glam::{Mat4, Vec3};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::config::SorterConfig;
use crate::error::{Result, ViewerError};
use crate::loader::SplatSink;
use crate::matrix::forward_axis;
use crate::ply::convert_ply;
use crate::structures::{complete_records, RECORD_SIZE};
use crate::texture::SplatTexture;

#[derive(Debug, Clone)]
pub enum SorterRequest {
    /// A (possibly growing) native buffer; only the first `record_count` records are used.
    Records { buffer: Vec<u8>, record_count: usize },
    /// The camera moved.
    View { view_proj: Mat4 },
    /// A whole PLY file to convert before sorting.
    ConvertPly { buffer: Vec<u8>, save: bool },
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum SorterResponse {
    Texture(SplatTexture),
    /// Instance indices, farthest splat first.
    DepthIndex { indices: Vec<u32>, vertex_count: usize },
    Converted {
        buffer: Vec<u8>,
        record_count: usize,
        save: bool,
    },
    ConversionFailed(String),
}

/// Sorts the first `count` records of `buffer` by depth along `forward`, farthest first,
/// with a single-pass counting sort over `buckets` quantized depth levels.
pub fn sort_far_to_near(buffer: &[u8], count: usize, forward: Vec3, buckets: usize) -> Vec<u32> {
    let n = count.min(complete_records(buffer.len()));
    if n == 0 {
        return Vec::new();
    }
    let buckets = buckets.max(2);

    let mut depths = Vec::with_capacity(n);
    let (mut min_depth, mut max_depth) = (f32::INFINITY, f32::NEG_INFINITY);
    for rec in buffer.chunks_exact(RECORD_SIZE).take(n) {
        let x = f32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]);
        let y = f32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]);
        let z = f32::from_le_bytes([rec[8], rec[9], rec[10], rec[11]]);
        let depth = forward.x * x + forward.y * y + forward.z * z;
        if depth < min_depth {
            min_depth = depth;
        }
        if depth > max_depth {
            max_depth = depth;
        }
        depths.push(depth);
    }

    let range = max_depth - min_depth;
    let scale = if range.is_finite() && range > 0.0 {
        (buckets - 1) as f32 / range
    } else {
        0.0
    };

    // Bucket 0 holds the farthest splats.
    let last = buckets - 1;
    let keys: Vec<u32> = depths
        .iter()
        .map(|&d| (((max_depth - d) * scale) as usize).min(last) as u32)
        .collect();

    let mut starts = vec![0u32; buckets];
    for &k in &keys {
        starts[k as usize] += 1;
    }
    let mut running = 0u32;
    for slot in starts.iter_mut() {
        let count = *slot;
        *slot = running;
        running += count;
    }

    let mut order = vec![0u32; n];
    for (i, &k) in keys.iter().enumerate() {
        let slot = &mut starts[k as usize];
        order[*slot as usize] = i as u32;
        *slot += 1;
    }
    order
}

/// Worker-side state. Pure and synchronous so it can be driven directly in tests.
#[derive(Debug)]
pub struct DepthSorter {
    config: SorterConfig,
    buffer: Vec<u8>,
    record_count: usize,
    view_proj: Option<Mat4>,
    last_sorted: Option<(usize, Vec3)>,
}

impl DepthSorter {
    pub fn new(config: SorterConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            record_count: 0,
            view_proj: None,
            last_sorted: None,
        }
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn handle(&mut self, request: SorterRequest) -> Vec<SorterResponse> {
        let mut out = Vec::new();
        match request {
            SorterRequest::Records {
                buffer,
                record_count,
            } => self.set_records(buffer, record_count, &mut out),
            SorterRequest::View { view_proj } => {
                self.view_proj = Some(view_proj);
                self.sort_if_needed(&mut out);
            }
            SorterRequest::ConvertPly { buffer, save } => match convert_ply(&buffer) {
                Ok(converted) => {
                    let record_count = complete_records(converted.len());
                    out.push(SorterResponse::Converted {
                        buffer: converted.clone(),
                        record_count,
                        save,
                    });
                    self.set_records(converted, record_count, &mut out);
                }
                Err(e) => {
                    warn!("ply conversion failed: {}", e);
                    out.push(SorterResponse::ConversionFailed(e.to_string()));
                }
            },
            SorterRequest::Shutdown => {}
        }
        out
    }

    fn set_records(&mut self, mut buffer: Vec<u8>, claimed: usize, out: &mut Vec<SorterResponse>) {
        let available = complete_records(buffer.len());
        if claimed > available || buffer.len() % RECORD_SIZE != 0 {
            debug!(
                "truncating splat buffer: {} bytes, {} records claimed, {} complete",
                buffer.len(),
                claimed,
                available
            );
        }
        let count = claimed.min(available);
        buffer.truncate(count * RECORD_SIZE);
        self.buffer = buffer;
        self.record_count = count;
        // New data always needs a fresh order, even with an unchanged count.
        self.last_sorted = None;

        out.push(SorterResponse::Texture(SplatTexture::pack(
            &self.buffer,
            self.record_count,
        )));
        self.sort_if_needed(out);
    }

    fn sort_if_needed(&mut self, out: &mut Vec<SorterResponse>) {
        let Some(view_proj) = self.view_proj else {
            return;
        };
        let forward = forward_axis(&view_proj);

        if let Some((count, last_forward)) = self.last_sorted {
            if count == self.record_count {
                let dot = last_forward.normalize_or_zero().dot(forward.normalize_or_zero());
                if (dot - 1.0).abs() < self.config.view_change_threshold {
                    return;
                }
            }
        }

        let indices = sort_far_to_near(
            &self.buffer,
            self.record_count,
            forward,
            self.config.buckets,
        );
        self.last_sorted = Some((self.record_count, forward));
        out.push(SorterResponse::DepthIndex {
            vertex_count: indices.len(),
            indices,
        });
    }
}

/// Cloneable sending side of a worker.
#[derive(Debug, Clone)]
pub struct SorterHandle {
    tx: UnboundedSender<SorterRequest>,
    records_in_flight: Arc<AtomicUsize>,
}

impl SorterHandle {
    pub fn send(&self, request: SorterRequest) -> Result<()> {
        let is_records = matches!(request, SorterRequest::Records { .. });
        if is_records {
            self.records_in_flight.fetch_add(1, Ordering::AcqRel);
        }
        self.tx.send(request).map_err(|_| {
            if is_records {
                self.records_in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            ViewerError::WorkerGone
        })
    }

    /// Records requests sent but not yet texture-packed and sorted by the worker.
    pub fn records_in_flight(&self) -> usize {
        self.records_in_flight.load(Ordering::Acquire)
    }
}

impl SplatSink for SorterHandle {
    fn submit(&mut self, request: SorterRequest) -> Result<()> {
        self.send(request)
    }

    fn accepts_records(&self) -> bool {
        self.records_in_flight() == 0
    }
}

/// Owns the sorter thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct SorterWorker {
    handle: SorterHandle,
    responses: UnboundedReceiver<SorterResponse>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SorterWorker {
    pub fn spawn(config: SorterConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let sorter = DepthSorter::new(config);
        let records_in_flight = Arc::new(AtomicUsize::new(0));
        let acks = Arc::clone(&records_in_flight);

        let thread = thread::Builder::new()
            .name("splat-sorter".to_string())
            .spawn(move || run_worker(sorter, rx, resp_tx, acks))?;

        Ok(Self {
            handle: SorterHandle {
                tx,
                records_in_flight,
            },
            responses: resp_rx,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SorterHandle {
        self.handle.clone()
    }

    pub fn send(&self, request: SorterRequest) -> Result<()> {
        self.handle.send(request)
    }

    /// Non-blocking; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<SorterResponse> {
        self.responses.try_recv().ok()
    }

    /// Blocks until the next response; `None` once the worker has exited.
    pub fn blocking_recv(&mut self) -> Option<SorterResponse> {
        self.responses.blocking_recv()
    }

    pub async fn recv(&mut self) -> Option<SorterResponse> {
        self.responses.recv().await
    }

    pub fn shutdown(&mut self) {
        let _ = self.handle.send(SorterRequest::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("sorter thread panicked");
            }
        }
    }
}

impl Drop for SorterWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps every PLY conversion in arrival order, the newest records request that follows the
/// last conversion, and the newest view. Returns `None` on shutdown.
fn coalesce(batch: Vec<SorterRequest>) -> Option<Vec<SorterRequest>> {
    let mut conversions = Vec::new();
    let mut records = None;
    let mut view = None;
    for request in batch {
        match request {
            SorterRequest::Shutdown => return None,
            SorterRequest::View { .. } => view = Some(request),
            SorterRequest::ConvertPly { .. } => {
                records = None;
                conversions.push(request);
            }
            SorterRequest::Records { .. } => records = Some(request),
        }
    }
    if conversions.len() > 1 {
        debug!("{} PLY conversions queued in one batch", conversions.len());
    }
    Some(conversions.into_iter().chain(records).chain(view).collect())
}

fn run_worker(
    mut sorter: DepthSorter,
    mut rx: UnboundedReceiver<SorterRequest>,
    tx: UnboundedSender<SorterResponse>,
    records_in_flight: Arc<AtomicUsize>,
) {
    while let Some(first) = rx.blocking_recv() {
        let mut batch = vec![first];
        loop {
            match rx.try_recv() {
                Ok(next) => batch.push(next),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        let received = batch.len();
        let records = batch
            .iter()
            .filter(|r| matches!(r, SorterRequest::Records { .. }))
            .count();
        let Some(requests) = coalesce(batch) else {
            debug!("sorter worker shutting down");
            return;
        };

        let start = Instant::now();
        let responses: Vec<SorterResponse> = requests
            .into_iter()
            .flat_map(|request| sorter.handle(request))
            .collect();
        // Freed before any result of this batch is visible.
        records_in_flight.fetch_sub(records, Ordering::AcqRel);
        for response in responses {
            if tx.send(response).is_err() {
                return;
            }
        }
        debug!(
            "sorter batch: {} requests, {} records, {} us",
            received,
            sorter.record_count(),
            start.elapsed().as_micros()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{multiply, projection_matrix, rotate, translate};
    use crate::structures::SplatRecord;
    use std::time::Duration;
    use zerocopy::IntoBytes;

    fn pseudo_random_buffer(n: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.max(1);
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32) * 20.0 - 10.0
        };
        let mut out = Vec::with_capacity(n * RECORD_SIZE);
        for _ in 0..n {
            let rec = SplatRecord::new(
                [next(), next(), next()],
                [0.1, 0.1, 0.1],
                [200, 100, 50, 255],
                [1.0, 0.0, 0.0, 0.0],
            );
            out.extend_from_slice(rec.as_bytes());
        }
        out
    }

    fn view_proj(yaw: f32) -> Mat4 {
        let view = translate(&rotate(&Mat4::IDENTITY, yaw, 0.0, 1.0, 0.0), 0.0, 0.0, 8.0);
        multiply(&projection_matrix(1000.0, 1000.0, 1920.0, 1080.0), &view)
    }

    fn depth_of(buffer: &[u8], i: u32, forward: Vec3) -> f32 {
        let rec = SplatRecord::read(buffer, i as usize).unwrap();
        forward.dot(Vec3::from_array(rec.position))
    }

    #[test]
    fn orders_farthest_first_for_many_views() {
        let n = 5000;
        let buffer = pseudo_random_buffer(n, 0x9E37_79B9);
        let buckets = 1 << 16;
        for step in 0..12 {
            let vp = view_proj(step as f32 * 0.5);
            let forward = forward_axis(&vp);
            let order = sort_far_to_near(&buffer, n, forward, buckets);
            assert_eq!(order.len(), n);

            let depths: Vec<f32> = order.iter().map(|&i| depth_of(&buffer, i, forward)).collect();
            let (lo, hi) = depths
                .iter()
                .fold((f32::MAX, f32::MIN), |(lo, hi), &d| (lo.min(d), hi.max(d)));
            // Ties inside one quantization bucket keep input order.
            let bucket_width = (hi - lo) / (buckets - 1) as f32;
            for pair in depths.windows(2) {
                assert!(
                    pair[0] + bucket_width * 1.01 >= pair[1],
                    "{} drawn before farther {}",
                    pair[0],
                    pair[1]
                );
            }

            let mut seen = order.clone();
            seen.sort_unstable();
            assert!(seen.iter().enumerate().all(|(i, &v)| i as u32 == v));
        }
    }

    #[test]
    fn distinct_depths_are_strictly_ordered() {
        let mut buffer = Vec::new();
        for z in [3.0f32, -7.0, 12.5, 0.0, 4.0] {
            let rec = SplatRecord::new([0.0, 0.0, z], [1.0; 3], [0; 4], [1.0, 0.0, 0.0, 0.0]);
            buffer.extend_from_slice(rec.as_bytes());
        }
        let order = sort_far_to_near(&buffer, 5, Vec3::Z, 1 << 16);
        assert_eq!(order, vec![2, 4, 0, 3, 1]);
        let order = sort_far_to_near(&buffer, 5, -Vec3::Z, 1 << 16);
        assert_eq!(order, vec![1, 3, 0, 4, 2]);
    }

    #[test]
    fn degenerate_inputs_do_not_panic() {
        assert!(sort_far_to_near(&[], 10, Vec3::Z, 1 << 16).is_empty());
        let same = pseudo_random_buffer(1, 7).repeat(3);
        assert_eq!(sort_far_to_near(&same, 3, Vec3::Z, 1 << 16), vec![0, 1, 2]);
        let mut nan = same.clone();
        nan[0..4].copy_from_slice(&f32::NAN.to_le_bytes());
        assert_eq!(sort_far_to_near(&nan, 3, Vec3::X, 4).len(), 3);
    }

    #[test]
    fn trailing_partial_record_is_ignored() {
        let n = 37;
        let mut buffer = pseudo_random_buffer(n, 11);
        buffer.extend_from_slice(&[0x5A; 17]);

        let mut sorter = DepthSorter::new(SorterConfig::default());
        sorter.handle(SorterRequest::View {
            view_proj: view_proj(0.3),
        });
        let responses = sorter.handle(SorterRequest::Records {
            buffer,
            record_count: n + 1,
        });

        assert_eq!(sorter.record_count(), n);
        let mut saw_texture = false;
        let mut saw_index = false;
        for response in responses {
            match response {
                SorterResponse::Texture(tex) => {
                    saw_texture = true;
                    assert_eq!(tex.splat_count, n);
                }
                SorterResponse::DepthIndex {
                    indices,
                    vertex_count,
                } => {
                    saw_index = true;
                    assert_eq!(vertex_count, n);
                    assert!(indices.iter().all(|&i| (i as usize) < n));
                }
                other => panic!("unexpected response {:?}", other),
            }
        }
        assert!(saw_texture && saw_index);
    }

    #[test]
    fn small_camera_moves_skip_resort() {
        let buffer = pseudo_random_buffer(100, 3);
        let mut sorter = DepthSorter::new(SorterConfig::default());
        sorter.handle(SorterRequest::Records {
            buffer,
            record_count: 100,
        });

        let first = sorter.handle(SorterRequest::View {
            view_proj: view_proj(0.0),
        });
        assert_eq!(first.len(), 1);
        let nudge = sorter.handle(SorterRequest::View {
            view_proj: view_proj(0.001),
        });
        assert!(nudge.is_empty());
        let turn = sorter.handle(SorterRequest::View {
            view_proj: view_proj(1.0),
        });
        assert!(matches!(turn[0], SorterResponse::DepthIndex { vertex_count: 100, .. }));
    }

    fn records_along_z(zs: &[f32]) -> Vec<u8> {
        let mut buffer = Vec::new();
        for &z in zs {
            let rec = SplatRecord::new([0.0, 0.0, z], [1.0; 3], [9; 4], [1.0, 0.0, 0.0, 0.0]);
            buffer.extend_from_slice(rec.as_bytes());
        }
        buffer
    }

    fn order_of(responses: &[SorterResponse]) -> Option<Vec<u32>> {
        responses.iter().find_map(|r| match r {
            SorterResponse::DepthIndex { indices, .. } => Some(indices.clone()),
            _ => None,
        })
    }

    #[test]
    fn new_data_with_same_count_is_resorted() {
        let mut sorter = DepthSorter::new(SorterConfig::default());
        sorter.handle(SorterRequest::View {
            view_proj: Mat4::IDENTITY,
        });

        let first = sorter.handle(SorterRequest::Records {
            buffer: records_along_z(&[1.0, 2.0, 3.0]),
            record_count: 3,
        });
        assert_eq!(order_of(&first), Some(vec![2, 1, 0]));

        let reload = sorter.handle(SorterRequest::Records {
            buffer: records_along_z(&[3.0, 2.0, 1.0]),
            record_count: 3,
        });
        assert_eq!(order_of(&reload), Some(vec![0, 1, 2]));

        // Only camera updates may reuse the previous order.
        let same_view = sorter.handle(SorterRequest::View {
            view_proj: Mat4::IDENTITY,
        });
        assert!(same_view.is_empty());
    }

    #[test]
    fn bad_ply_reports_instead_of_panicking() {
        let mut sorter = DepthSorter::new(SorterConfig::default());
        let out = sorter.handle(SorterRequest::ConvertPly {
            buffer: b"ply\nnonsense".to_vec(),
            save: false,
        });
        assert!(matches!(out.as_slice(), [SorterResponse::ConversionFailed(_)]));
    }

    #[test]
    fn coalesce_keeps_latest_data_and_view() {
        let batch = vec![
            SorterRequest::Records {
                buffer: vec![0; 32],
                record_count: 1,
            },
            SorterRequest::View {
                view_proj: Mat4::IDENTITY,
            },
            SorterRequest::Records {
                buffer: vec![0; 64],
                record_count: 2,
            },
            SorterRequest::View {
                view_proj: Mat4::ZERO,
            },
        ];
        let kept = coalesce(batch).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(matches!(kept[0], SorterRequest::Records { record_count: 2, .. }));
        assert!(matches!(kept[1], SorterRequest::View { view_proj } if view_proj == Mat4::ZERO));
        assert!(coalesce(vec![SorterRequest::Shutdown]).is_none());
    }

    #[test]
    fn coalesce_never_drops_a_conversion() {
        let ply = |save| SorterRequest::ConvertPly {
            buffer: b"ply\n".to_vec(),
            save,
        };
        let batch = vec![
            SorterRequest::Records {
                buffer: vec![0; 32],
                record_count: 1,
            },
            ply(true),
            ply(false),
            SorterRequest::Records {
                buffer: vec![0; 64],
                record_count: 2,
            },
        ];
        let kept = coalesce(batch).unwrap();
        assert_eq!(kept.len(), 3);
        assert!(matches!(kept[0], SorterRequest::ConvertPly { save: true, .. }));
        assert!(matches!(kept[1], SorterRequest::ConvertPly { save: false, .. }));
        assert!(matches!(kept[2], SorterRequest::Records { record_count: 2, .. }));

        let kept = coalesce(vec![
            SorterRequest::Records {
                buffer: vec![0; 32],
                record_count: 1,
            },
            ply(true),
        ])
        .unwrap();
        assert_eq!(kept.len(), 1);
        assert!(matches!(kept[0], SorterRequest::ConvertPly { .. }));
    }

    #[test]
    fn records_slot_frees_once_sorted() {
        let mut worker = SorterWorker::spawn(SorterConfig::default()).unwrap();
        let handle = worker.handle();
        assert!(handle.accepts_records());

        handle
            .send(SorterRequest::Records {
                buffer: pseudo_random_buffer(16, 9),
                record_count: 16,
            })
            .unwrap();
        handle
            .send(SorterRequest::View {
                view_proj: view_proj(0.0),
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut sorted = false;
        while !sorted && Instant::now() < deadline {
            match worker.try_recv() {
                Some(SorterResponse::DepthIndex { .. }) => sorted = true,
                Some(_) => {}
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        assert!(sorted);
        assert_eq!(handle.records_in_flight(), 0);
        assert!(handle.accepts_records());
    }

    #[test]
    fn worker_round_trip() {
        let mut worker = SorterWorker::spawn(SorterConfig::default()).unwrap();
        worker
            .send(SorterRequest::View {
                view_proj: view_proj(0.2),
            })
            .unwrap();
        worker
            .send(SorterRequest::Records {
                buffer: pseudo_random_buffer(64, 5),
                record_count: 64,
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut sorted = None;
        while sorted.is_none() && Instant::now() < deadline {
            match worker.try_recv() {
                Some(SorterResponse::DepthIndex { vertex_count, .. }) => sorted = Some(vertex_count),
                Some(_) => {}
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        assert_eq!(sorted, Some(64));

        worker.shutdown();
        assert!(worker.send(SorterRequest::Shutdown).is_err());
    }
}
