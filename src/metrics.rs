//! Prometheus gauges/counters and the `/metrics` endpoint.
//!
//! Grounded on the teacher's `monitoring.rs` (`static_prom!` pattern,
//! `start_web_server`), generalised from single-telescope globals to
//! per-station/per-band label dimensions since this crate runs N stations
//! in parallel rather than one fixed instrument.

use actix_web::{dev::Server, get, App, HttpResponse, HttpServer, Responder};
use prometheus::{
    register_gauge_vec, register_int_counter_vec, register_int_gauge_vec, GaugeVec, IntCounterVec, IntGaugeVec,
    TextEncoder,
};
use std::sync::OnceLock;
use tracing::info;
use tracing_actix_web::TracingLogger;

fn pga_gauge() -> &'static GaugeVec {
    static G: OnceLock<GaugeVec> = OnceLock::new();
    G.get_or_init(|| {
        register_gauge_vec!("quakewatch_pga_mps2", "Most recent peak ground acceleration, m/s^2", &["station", "stream"])
            .unwrap()
    })
}

fn latency_gauge() -> &'static GaugeVec {
    static G: OnceLock<GaugeVec> = OnceLock::new();
    G.get_or_init(|| {
        register_gauge_vec!("quakewatch_latency_seconds", "Most recent end-to-end data latency", &["station", "stream"]).unwrap()
    })
}

fn band_active_gauge() -> &'static IntGaugeVec {
    static G: OnceLock<IntGaugeVec> = OnceLock::new();
    G.get_or_init(|| {
        register_int_gauge_vec!("quakewatch_band_active", "1 if this station/band is the currently classified band", &["station", "band"]).unwrap()
    })
}

fn alarms_total() -> &'static IntCounterVec {
    static G: OnceLock<IntCounterVec> = OnceLock::new();
    G.get_or_init(|| {
        register_int_counter_vec!("quakewatch_alarms_total", "Threshold alarms emitted, by station and band", &["station", "band"]).unwrap()
    })
}

fn latency_alarms_total() -> &'static IntCounterVec {
    static G: OnceLock<IntCounterVec> = OnceLock::new();
    G.get_or_init(|| {
        register_int_counter_vec!("quakewatch_latency_alarms_total", "Late-data alarms emitted, by station", &["station"]).unwrap()
    })
}

fn worker_up_gauge() -> &'static IntGaugeVec {
    static G: OnceLock<IntGaugeVec> = OnceLock::new();
    G.get_or_init(|| register_int_gauge_vec!("quakewatch_worker_up", "1 while a station's worker loop is running", &["station"]).unwrap())
}

pub fn record_pga(station: &str, stream: &str, value: f64) {
    pga_gauge().with_label_values(&[station, stream]).set(value);
}

pub fn record_latency(station: &str, stream: &str, seconds: f64) {
    latency_gauge().with_label_values(&[station, stream]).set(seconds);
}

pub fn record_band<'a>(station: &str, bands: impl IntoIterator<Item = &'a str>, active: &str) {
    for band in bands {
        band_active_gauge().with_label_values(&[station, band]).set(i64::from(band == active));
    }
}

pub fn record_alarm(station: &str, band: &str) {
    alarms_total().with_label_values(&[station, band]).inc();
}

pub fn record_latency_alarm(station: &str) {
    latency_alarms_total().with_label_values(&[station]).inc();
}

pub fn set_worker_up(station: &str, up: bool) {
    worker_up_gauge().with_label_values(&[station]).set(i64::from(up));
}

#[get("/metrics")]
async fn metrics() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    HttpResponse::Ok().body(encoder.encode_to_string(&metric_families).unwrap())
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

pub fn start_web_server(port: u16) -> eyre::Result<Server> {
    info!(port, "starting metrics webserver");
    let server = HttpServer::new(|| App::new().wrap(TracingLogger::default()).service(metrics).service(health))
        .bind(("0.0.0.0", port))?
        .workers(1)
        .run();
    Ok(server)
}
