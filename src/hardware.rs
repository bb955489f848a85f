// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Seam for per-sensor acquisition drivers (serial, I2C, BLE, camera).

use crate::reading::SensorPayload;

/// A synchronous source of sensor readings.
///
/// `read` must return promptly; `None` means "no new reading this time".
pub trait HardwareReader {
    type Payload: SensorPayload;

    fn read(&mut self) -> Option<Self::Payload>;
}

/// Replays a fixed sequence of payloads, then reports nothing.
pub struct ScriptedReader<P> {
    pending: std::collections::VecDeque<P>,
}

impl<P> ScriptedReader<P> {
    pub fn new(payloads: impl IntoIterator<Item = P>) -> Self {
        Self {
            pending: payloads.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl<P: SensorPayload> HardwareReader for ScriptedReader<P> {
    type Payload = P;

    fn read(&mut self) -> Option<P> {
        self.pending.pop_front()
    }
}
