//! API shared state

use crate::relay::StatusHandle;

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub status: StatusHandle,
}

impl ApiState {
    pub fn new(status: StatusHandle) -> Self {
        Self { status }
    }
}
