use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider, UpDownCounter},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    sessions_total: Counter<u64>,
    active_sessions: UpDownCounter<i64>,
    frames_received: Counter<u64>,
    frames_dropped: Counter<u64>,
    results_sent: Counter<u64>,
    inference_duration: Histogram<u64>,
    // Dropping the last provider handle shuts its readers down.
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    /// Counters are exported with a `_total` suffix added by the exporter.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("detection_server");
        global::set_meter_provider(provider.clone());

        let sessions_total = meter
            .u64_counter("detection_sessions")
            .with_description("Finished websocket detection sessions by outcome")
            .build();

        let active_sessions = meter
            .i64_up_down_counter("detection_sessions_active")
            .with_description("Websocket detection sessions currently open")
            .build();

        let frames_received = meter
            .u64_counter("frames_received")
            .with_description("Frames received from websocket clients")
            .build();

        let frames_dropped = meter
            .u64_counter("frames_dropped")
            .with_description("Frames dropped because inference was still busy")
            .build();

        let results_sent = meter
            .u64_counter("detection_results_sent")
            .with_description("Detection results delivered to clients")
            .build();

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of decode and inference in milliseconds")
            .build();

        Ok(Metrics {
            sessions_total,
            active_sessions,
            frames_received,
            frames_dropped,
            results_sent,
            inference_duration,
            _provider: provider,
            registry,
        })
    }

    pub fn record_session_opened(&self) {
        self.active_sessions.add(1, &[]);
    }

    pub fn record_session_closed(&self, outcome: &str) {
        let attributes = vec![KeyValue::new("outcome", outcome.to_string())];
        self.sessions_total.add(1, &attributes);
        self.active_sessions.add(-1, &[]);
    }

    pub fn record_frame_received(&self) {
        self.frames_received.add(1, &[]);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.add(1, &[]);
    }

    pub fn record_result_sent(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.results_sent.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.inference_duration.record(duration_ms, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
