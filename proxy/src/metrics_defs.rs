use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Plugin proxy request duration in seconds. Tagged with status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of plugin proxy requests currently being processed",
};

pub const DIRECTOR_FAILURES: MetricDef = MetricDef {
    name: "director.failures",
    metric_type: MetricType::Counter,
    description: "Requests aborted while being rewritten for the plugin backend. Tagged with kind.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION, REQUESTS_INFLIGHT, DIRECTOR_FAILURES];
