// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingestion and query API.
//!
//! Every call asks the oracle first; the verdict is cached, so this costs a
//! probe at most once per TTL.

use tracing::{debug, warn};

use crate::hardware::HardwareReader;
use crate::metrics::LatencyTimer;
use crate::reading::{Reading, SensorPayload};
use crate::store::{DeleteReport, StoreError, WriteReport};

use super::{IngestReport, SensorSync};

impl SensorSync {
    /// Register a sensor type: create its local table and include it in
    /// reconciliation.
    pub async fn track<P: SensorPayload>(&self) -> Result<(), StoreError> {
        let online = self.oracle.is_online().await;
        self.store.ensure_table(P::TABLE, online).await?;
        self.reconciler.track::<P>();
        Ok(())
    }

    /// Take one reading through the pipeline: store it (unless transient),
    /// then forward it to the bus.
    ///
    /// The publish happens even when the local write fails; the local error
    /// is then returned.
    #[tracing::instrument(skip(self, payload), fields(table = P::TABLE))]
    pub async fn ingest<P: SensorPayload>(
        &self,
        project_id: i64,
        payload: P,
        event: bool,
    ) -> Result<IngestReport<P>, StoreError> {
        let _timer = LatencyTimer::new("pipeline", "ingest");
        if project_id <= 0 {
            return Err(StoreError::InvalidInput(format!(
                "project_id must be positive, got {}",
                project_id
            )));
        }

        let online = self.oracle.is_online().await;
        let reading = if event {
            Reading::new(project_id, payload)
        } else {
            Reading::transient(project_id, payload)
        };

        let stored: Option<Result<WriteReport<P>, StoreError>> = if event {
            Some(self.store.save(reading.clone(), online).await)
        } else {
            None
        };

        let outbound = match &stored {
            Some(Ok(report)) => &report.reading,
            _ => &reading,
        };
        let published = self.forward(outbound);

        match stored {
            None => Ok(IngestReport {
                reading,
                remote: None,
                published,
            }),
            Some(Ok(report)) => Ok(IngestReport {
                reading: report.reading,
                remote: Some(report.remote),
                published,
            }),
            Some(Err(e)) => Err(e),
        }
    }

    /// Enqueue a reading for the bus. Never blocks, never fails the caller.
    fn forward<P: SensorPayload>(&self, reading: &Reading<P>) -> bool {
        let Some(publisher) = &self.publisher else {
            return false;
        };
        match reading.to_message_bytes() {
            Ok(bytes) => publisher.publish(P::TABLE, bytes),
            Err(e) => {
                warn!(table = P::TABLE, error = %e, "Reading not serializable for the bus");
                false
            }
        }
    }

    /// Read once from `reader` and ingest the result, if any.
    pub async fn poll<R: HardwareReader>(
        &self,
        reader: &mut R,
        project_id: i64,
        event: bool,
    ) -> Result<Option<IngestReport<R::Payload>>, StoreError> {
        match reader.read() {
            Some(payload) => self.ingest(project_id, payload, event).await.map(Some),
            None => {
                debug!(table = <R::Payload as SensorPayload>::TABLE, "No new reading");
                Ok(None)
            }
        }
    }

    /// Store a reading without publishing it.
    pub async fn save<P: SensorPayload>(&self, reading: Reading<P>) -> Result<WriteReport<P>, StoreError> {
        let online = self.oracle.is_online().await;
        self.store.save(reading, online).await
    }

    pub async fn update<P: SensorPayload>(&self, reading: Reading<P>) -> Result<WriteReport<P>, StoreError> {
        let online = self.oracle.is_online().await;
        self.store.update(reading, online).await
    }

    pub async fn delete<P: SensorPayload>(&self, project_id: i64) -> Result<DeleteReport, StoreError> {
        let online = self.oracle.is_online().await;
        self.store.delete::<P>(project_id, online).await
    }

    pub async fn get_by_id<P: SensorPayload>(&self, id: i64) -> Result<Reading<P>, StoreError> {
        let online = self.oracle.is_online().await;
        self.store.get_by_id(id, online).await
    }

    pub async fn get_by_project_id<P: SensorPayload>(&self, project_id: i64) -> Result<Vec<Reading<P>>, StoreError> {
        let online = self.oracle.is_online().await;
        self.store.get_by_project_id(project_id, online).await
    }

    pub async fn exists_by_project<P: SensorPayload>(&self, project_id: i64) -> Result<bool, StoreError> {
        let online = self.oracle.is_online().await;
        self.store.exists_by_project::<P>(project_id, online).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::harness;
    use crate::hardware::ScriptedReader;
    use crate::reading::{Reading, SensorPayload};
    use crate::sensors::{Environment, GpsFix};
    use crate::store::{RemoteOutcome, StoreError};

    fn env(temperature_c: f64) -> Environment {
        Environment {
            temperature_c,
            humidity_pct: 55.0,
            pressure_hpa: Some(1013.2),
        }
    }

    #[tokio::test]
    async fn test_ingest_online_stores_replicates_and_publishes() {
        let h = harness(true);
        let report = h.engine.ingest(3, env(20.0), true).await.unwrap();

        assert_eq!(report.remote, Some(RemoteOutcome::Confirmed));
        assert!(report.published);
        assert!(report.reading.synced);
        assert_eq!(h.local.len(Environment::TABLE), 1);
        assert_eq!(h.remote.len(Environment::TABLE), 1);
        assert_eq!(h.engine.publisher().unwrap().queue_len(), 1);
    }

    #[tokio::test]
    async fn test_transient_reading_is_only_published() {
        let h = harness(true);
        let report = h.engine.ingest(3, env(20.0), false).await.unwrap();

        assert_eq!(report.remote, None);
        assert!(report.published);
        assert!(report.reading.id.is_none());
        assert!(h.local.is_empty(Environment::TABLE));
    }

    #[tokio::test]
    async fn test_invalid_project_rejected_before_anything_happens() {
        let h = harness(true);
        let err = h.engine.ingest(0, env(1.0), true).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
        assert_eq!(h.engine.publisher().unwrap().stats().enqueued, 0);
    }

    #[tokio::test]
    async fn test_published_message_carries_local_id() {
        let h = harness(false);
        let report = h.engine.ingest(9, env(18.5), true).await.unwrap();
        let id = report.reading.id.unwrap();

        h.engine.start().unwrap();
        while h.bus.published().is_empty() {
            tokio::task::yield_now().await;
        }
        h.engine.shutdown().await;

        let (topic, payload) = &h.bus.published()[0];
        assert_eq!(topic, "sensors.environment_readings");
        let message: Reading<Environment> = serde_json::from_slice(payload).unwrap();
        assert_eq!(message.id, Some(id));
        assert_eq!(message.payload, env(18.5));
    }

    #[tokio::test]
    async fn test_poll_ingests_until_reader_is_empty() {
        let h = harness(false);
        let fix = GpsFix {
            latitude: 51.5,
            longitude: -0.12,
            altitude_m: None,
            satellites: 7,
        };
        let mut reader = ScriptedReader::new([fix]);

        assert!(h.engine.poll(&mut reader, 2, true).await.unwrap().is_some());
        assert!(h.engine.poll(&mut reader, 2, true).await.unwrap().is_none());
        assert!(h.engine.exists_by_project::<GpsFix>(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_query_passthroughs_offline() {
        let h = harness(false);
        let saved = h.engine.save(Reading::new(5, env(10.0))).await.unwrap().reading;

        let got: Reading<Environment> = h.engine.get_by_id(saved.id.unwrap()).await.unwrap();
        assert_eq!(got, saved);

        let mut changed = got.clone();
        changed.payload.temperature_c = 11.0;
        h.engine.update(changed).await.unwrap();
        let all = h.engine.get_by_project_id::<Environment>(5).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload.temperature_c, 11.0);

        let report = h.engine.delete::<Environment>(5).await.unwrap();
        assert_eq!(report.local_removed, 1);
        assert_eq!(report.remote, RemoteOutcome::Offline);
        assert!(!h.engine.exists_by_project::<Environment>(5).await.unwrap());
    }

    #[test]
    fn test_ingest_latency_is_not_attributed_to_a_tier() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let h = harness(true);
                h.engine.ingest(3, env(20.0), true).await.unwrap();
            })
        });

        let tiers: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().clone())
            .filter(|key| key.name() == "sensor_sync_operation_seconds")
            .filter(|key| key.labels().any(|l| l.key() == "operation" && l.value() == "ingest"))
            .filter_map(|key| key.labels().find(|l| l.key() == "tier").map(|l| l.value().to_string()))
            .collect();
        assert_eq!(tiers, vec!["pipeline".to_string()]);
    }

    #[tokio::test]
    async fn test_track_registers_table() {
        let h = harness(false);
        h.engine.track::<GpsFix>().await.unwrap();
        assert_eq!(h.engine.health().tracked_tables, vec!["gps_readings"]);
    }
}
