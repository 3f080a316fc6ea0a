use thiserror::Error;

/// Problems found while loading configuration. Each one rejects a single
/// item (module, sensor observation, schedule); the rest of the node keeps
/// loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("request set `{0}` listed in requestsOrder is not defined")]
    UnknownRequestSet(String),

    #[error("invalid response pattern for request set `{name}`: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("next receiver index {index} is out of range for {len} receivers")]
    ReceiverOutOfRange { index: usize, len: usize },

    #[error("unknown receiver `{0}`")]
    UnknownReceiver(String),

    #[error("unknown sensor `{0}`")]
    UnknownSensor(String),

    #[error("unknown observation `{observation}` of sensor `{sensor}`")]
    UnknownObservation { sensor: String, observation: String },

    #[error("start date {start} is after end date {end}")]
    InvertedDateRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("time range {start}-{end} ends before it starts")]
    InvertedTimeRange {
        start: chrono::NaiveTime,
        end: chrono::NaiveTime,
    },

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures of the transport underneath a port module.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("failed to open {target}: {reason}")]
    Open { target: String, reason: String },

    #[error("port is not open")]
    NotOpen,

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("sensor communication failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: Box<PortError> },
}

/// Malformed messages on the intercom.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is neither an observation nor a notification envelope")]
    InvalidEnvelope,

    #[error("unknown notification type `{0}`")]
    UnknownTag(String),

    #[error("notification `{tag}` is missing required fields: {missing:?}")]
    MissingFields {
        tag: &'static str,
        missing: Vec<&'static str>,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
