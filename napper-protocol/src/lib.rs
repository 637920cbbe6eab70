pub mod protocol;

pub use protocol::{
    AppSummary, ControlAction, ControlRequest, ControlResponse, HealthReport, StatusSnapshot,
    SERVICE_NAME,
};
