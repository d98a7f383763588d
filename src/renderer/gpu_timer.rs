use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub const GATHER_PASS_LABEL: &str = "cluster_gather";
pub const CULL_PASS_LABEL: &str = "cluster_cull";

/// Begin/end timestamp pairs for the gather and cull passes.
const TIMESTAMP_COUNT: u32 = 4;

const READBACK_IDLE: u8 = 0;
const READBACK_PENDING: u8 = 1;
const READBACK_READY: u8 = 2;
const READBACK_FAILED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuPassTiming {
    pub label: &'static str,
    pub duration_ms: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClusterTimings {
    pub gather_ms: f32,
    pub cull_ms: f32,
}

impl ClusterTimings {
    pub fn as_pass_timings(&self) -> [GpuPassTiming; 2] {
        [
            GpuPassTiming { label: GATHER_PASS_LABEL, duration_ms: self.gather_ms },
            GpuPassTiming { label: CULL_PASS_LABEL, duration_ms: self.cull_ms },
        ]
    }
}

/// Timestamp queries around the two cluster compute passes. Results are read
/// back without blocking: a frame whose readback is still in flight simply
/// skips its timestamps, and the last completed measurement stays available.
pub struct GpuPassTimer {
    query_set: wgpu::QuerySet,
    resolve_buffer: wgpu::Buffer,
    readback_buffer: wgpu::Buffer,
    period_ns: f32,
    readback_state: Arc<AtomicU8>,
    recording: bool,
    latest: Option<ClusterTimings>,
}

impl GpuPassTimer {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("Cluster Timestamp Queries"),
            ty: wgpu::QueryType::Timestamp,
            count: TIMESTAMP_COUNT,
        });
        let size = TIMESTAMP_COUNT as u64 * wgpu::QUERY_SIZE as u64;
        let resolve_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cluster Timestamp Resolve"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cluster Timestamp Readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            query_set,
            resolve_buffer,
            readback_buffer,
            period_ns: queue.get_timestamp_period(),
            readback_state: Arc::new(AtomicU8::new(READBACK_IDLE)),
            recording: false,
            latest: None,
        }
    }

    /// Starts a measured frame unless the previous readback is still mapped or pending.
    pub fn begin_frame(&mut self) -> bool {
        self.recording = self.readback_state.load(Ordering::Acquire) == READBACK_IDLE;
        self.recording
    }

    /// Timestamp writes for pass `pass_index` (0 = gather, 1 = cull).
    pub fn pass_writes(&self, pass_index: u32) -> Option<wgpu::ComputePassTimestampWrites<'_>> {
        if !self.recording {
            return None;
        }
        Some(wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: Some(pass_index * 2),
            end_of_pass_write_index: Some(pass_index * 2 + 1),
        })
    }

    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        if !self.recording {
            return;
        }
        encoder.resolve_query_set(&self.query_set, 0..TIMESTAMP_COUNT, &self.resolve_buffer, 0);
        encoder.copy_buffer_to_buffer(&self.resolve_buffer, 0, &self.readback_buffer, 0, self.resolve_buffer.size());
    }

    /// Requests the mapping once the frame's command buffer was submitted.
    pub fn after_submit(&mut self) {
        if !self.recording {
            return;
        }
        self.recording = false;
        self.readback_state.store(READBACK_PENDING, Ordering::Release);
        let state = Arc::clone(&self.readback_state);
        self.readback_buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let next = if result.is_ok() { READBACK_READY } else { READBACK_FAILED };
            state.store(next, Ordering::Release);
        });
    }

    /// Non-blocking: consumes a finished readback if one is available and
    /// returns it. Older results stay reachable through `latest`.
    pub fn poll(&mut self, device: &wgpu::Device) -> Option<ClusterTimings> {
        if let Err(err) = device.poll(wgpu::PollType::Poll) {
            debug!("Timestamp poll failed: {err}");
        }
        let mut fresh = None;
        match self.readback_state.load(Ordering::Acquire) {
            READBACK_READY => {
                let timings = {
                    let data = self.readback_buffer.slice(..).get_mapped_range();
                    let ticks: Vec<u64> = data.chunks_exact(8).map(bytemuck::pod_read_unaligned::<u64>).collect();
                    timings_from_ticks(&ticks, self.period_ns)
                };
                self.readback_buffer.unmap();
                self.readback_state.store(READBACK_IDLE, Ordering::Release);
                if let Some(timings) = timings {
                    debug!("Cluster passes: gather {:.3} ms, cull {:.3} ms", timings.gather_ms, timings.cull_ms);
                    self.latest = Some(timings);
                    fresh = Some(timings);
                }
            }
            READBACK_FAILED => {
                debug!("Timestamp readback mapping failed; dropping sample");
                self.readback_state.store(READBACK_IDLE, Ordering::Release);
            }
            _ => {}
        }
        fresh
    }

    pub fn latest(&self) -> Option<ClusterTimings> {
        self.latest
    }
}

/// Converts raw begin/end ticks into milliseconds. Inverted pairs (timer resets)
/// yield `None`.
pub fn timings_from_ticks(ticks: &[u64], period_ns: f32) -> Option<ClusterTimings> {
    let [gather_begin, gather_end, cull_begin, cull_end]: [u64; 4] = ticks.get(..4)?.try_into().ok()?;
    let to_ms = |begin: u64, end: u64| end.checked_sub(begin).map(|delta| delta as f64 * period_ns as f64 / 1.0e6);
    Some(ClusterTimings {
        gather_ms: to_ms(gather_begin, gather_end)? as f32,
        cull_ms: to_ms(cull_begin, cull_end)? as f32,
    })
}

#[derive(Debug, Default)]
struct PassSamples {
    samples: Vec<f32>,
    max_ms: f32,
}

impl PassSamples {
    fn record(&mut self, value: f32) {
        self.samples.push(value);
        if value > self.max_ms {
            self.max_ms = value;
        }
    }

    fn latest(&self) -> Option<f32> {
        self.samples.last().copied()
    }

    fn mean(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f32 = self.samples.iter().copied().sum();
        Some(sum / self.samples.len() as f32)
    }
}

/// Collects GPU pass timings across frames.
#[derive(Debug, Default)]
pub struct GpuTimingAccumulator {
    frame_count: usize,
    passes: BTreeMap<&'static str, PassSamples>,
}

impl GpuTimingAccumulator {
    pub fn record_frame(&mut self, timings: &[GpuPassTiming]) {
        if timings.is_empty() {
            return;
        }
        self.frame_count += 1;
        for timing in timings {
            self.passes.entry(timing.label).or_default().record(timing.duration_ms);
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn summary(&self) -> Vec<GpuPassSummary> {
        self.passes
            .iter()
            .filter_map(|(label, samples)| {
                Some(GpuPassSummary {
                    label: label.to_string(),
                    latest_ms: samples.latest()?,
                    average_ms: samples.mean()?,
                    max_ms: samples.max_ms,
                    sample_count: samples.samples.len(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GpuPassSummary {
    pub label: String,
    pub latest_ms: f32,
    pub average_ms: f32,
    pub max_ms: f32,
    pub sample_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_convert_with_period() {
        let timings = timings_from_ticks(&[1_000, 3_000, 5_000, 5_500], 1.0).expect("valid ticks");
        assert!((timings.gather_ms - 0.002).abs() < 1e-7);
        assert!((timings.cull_ms - 0.0005).abs() < 1e-7);
        assert!(timings_from_ticks(&[10, 5, 0, 1], 1.0).is_none());
        assert!(timings_from_ticks(&[1, 2], 1.0).is_none());
    }

    #[test]
    fn accumulator_reports_latest_mean_and_max() {
        let mut accumulator = GpuTimingAccumulator::default();
        accumulator.record_frame(&ClusterTimings { gather_ms: 1.0, cull_ms: 4.0 }.as_pass_timings());
        accumulator.record_frame(&ClusterTimings { gather_ms: 3.0, cull_ms: 2.0 }.as_pass_timings());
        accumulator.record_frame(&[]);
        assert_eq!(accumulator.frame_count(), 2);
        let summary = accumulator.summary();
        assert_eq!(summary.len(), 2);
        let cull = summary.iter().find(|pass| pass.label == CULL_PASS_LABEL).expect("cull pass");
        assert_eq!(cull.latest_ms, 2.0);
        assert_eq!(cull.average_ms, 3.0);
        assert_eq!(cull.max_ms, 4.0);
        assert_eq!(cull.sample_count, 2);
    }
}
