//! Sparkplug session state machine.
//!
//! Owned by the broker I/O worker, which is the single writer of the alias
//! store, the birth cache and the `seq` counter. The session is pure over
//! its store: every transition returns the messages to put on the wire, so
//! the state machine is testable without a broker.
//!
//! Transitions:
//! - connect → NBIRTH (`bdSeq` + rebirth control, seq 0), then DBIRTH for
//!   every device restored from the birth cache
//! - first data for a device → DBIRTH with every known metric and its alias
//! - subsequent data → alias-only DDATA
//! - rebirth command → `bdSeq`+1, seq reset, NBIRTH, DBIRTHs from cache
//! - device stale → DDEATH; graceful shutdown → DDEATHs then NDEATH

use crate::config::SparkplugConfig;
use aas_uplink_core::LeafRecord;
use aas_uplink_proto::payload::{ndeath_payload, PayloadBuilder};
use aas_uplink_proto::{SparkplugMessageType, SparkplugTopicScheme};
use aas_uplink_state::{SparkplugStore, StateError};
use std::collections::{HashMap, HashSet, VecDeque};

/// One message for the wire. All lifecycle-plane traffic is QoS 0,
/// retain false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Topic to publish on
    pub topic: String,
    /// Serialised payload
    pub payload: Vec<u8>,
}

/// Session state machine over the persistent Sparkplug store.
pub struct SparkplugSession {
    config: SparkplugConfig,
    scheme: SparkplugTopicScheme,
    store: SparkplugStore,
    bd_seq: u64,
    seq: u8,
    online: bool,
    devices: HashSet<String>,
    /// Data buffered while a DBIRTH is blocked on an alias-store failure
    pending: HashMap<String, VecDeque<Vec<LeafRecord>>>,
}

impl SparkplugSession {
    /// Create a session over its store.
    #[must_use]
    pub fn new(config: SparkplugConfig, store: SparkplugStore) -> Self {
        let scheme = SparkplugTopicScheme::new(&config.group_id, &config.edge_node_id);
        Self {
            config,
            scheme,
            store,
            bd_seq: 0,
            seq: 0,
            online: false,
            devices: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    /// Consume the current `seq` and advance it (wraps 255→0 without reset
    /// semantics).
    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn edge_node(&self) -> &str {
        &self.config.edge_node_id
    }

    /// `bdSeq` of the session about to be established, for the last-will.
    ///
    /// # Errors
    ///
    /// Returns error if the store query fails.
    pub fn will(&self, now_ms: i64) -> Result<(String, Vec<u8>), StateError> {
        let bd_seq = self.store.peek_next_bd_seq(self.edge_node())?;
        Ok((
            self.scheme.node(SparkplugMessageType::Ndeath),
            ndeath_payload(bd_seq, now_ms.max(0) as u64),
        ))
    }

    /// Topic carrying rebirth commands for this node.
    #[must_use]
    pub fn command_topic(&self) -> String {
        self.scheme.node(SparkplugMessageType::Ncmd)
    }

    /// Establish the session after a successful connect: commit the new
    /// `bdSeq`, emit NBIRTH, then a DBIRTH per cached device.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails; the caller aborts the connect and
    /// backs off.
    pub fn on_connect(&mut self, now_ms: i64) -> Result<Vec<Outbound>, StateError> {
        let edge_node = self.edge_node().to_string();
        let bd_seq = self.store.peek_next_bd_seq(&edge_node)?;
        self.store.commit_bd_seq(&edge_node, bd_seq)?;
        self.bd_seq = bd_seq;
        self.seq = 0;
        self.online = true;

        let mut out = vec![self.nbirth(now_ms)];
        out.extend(self.rebirth_devices()?);
        tracing::info!(
            bd_seq,
            devices = self.devices.len(),
            "Sparkplug session established"
        );
        Ok(out)
    }

    fn nbirth(&mut self, now_ms: i64) -> Outbound {
        let seq = self.next_seq();
        Outbound {
            topic: self.scheme.node(SparkplugMessageType::Nbirth),
            payload: PayloadBuilder::new(now_ms.max(0) as u64)
                .seq(seq)
                .bd_seq(self.bd_seq)
                .rebirth_control()
                .build(),
        }
    }

    /// Republish cached DBIRTHs, restoring the active device set. The cached
    /// payload carries the pre-restart alias map bit-identically, but the
    /// envelope `seq` must belong to this session, so the payload is
    /// re-enveloped.
    fn rebirth_devices(&mut self) -> Result<Vec<Outbound>, StateError> {
        let births = self.store.births(self.edge_node())?;
        let mut out = Vec::with_capacity(births.len());
        for birth in births {
            let seq = self.next_seq();
            let payload = match reseq_payload(&birth.payload, seq) {
                Some(payload) => payload,
                None => {
                    tracing::warn!(device_id = %birth.device_id, "Corrupt cached birth, skipping");
                    continue;
                }
            };
            self.devices.insert(birth.device_id.clone());
            out.push(Outbound {
                topic: birth.topic,
                payload,
            });
        }
        Ok(out)
    }

    /// Handle data for one device: DBIRTH on first sight, alias-only DDATA
    /// afterwards. `all` is the device's complete metric set, `changed` the
    /// subset that actually changed.
    ///
    /// Alias-store failures buffer the batch; no data message is ever sent
    /// before the device's DBIRTH succeeded.
    ///
    /// # Errors
    ///
    /// Returns error only for non-alias store failures (birth cache).
    pub fn on_device_data(
        &mut self,
        device_id: &str,
        all: &[LeafRecord],
        changed: &[LeafRecord],
        now_ms: i64,
    ) -> Result<Vec<Outbound>, StateError> {
        if !self.online {
            tracing::warn!(device_id, "Data before NBIRTH, buffering");
            self.pending
                .entry(device_id.to_string())
                .or_default()
                .push_back(changed.to_vec());
            return Ok(Vec::new());
        }

        let mut out = Vec::new();

        if !self.devices.contains(device_id) {
            match self.dbirth(device_id, all, now_ms) {
                Ok(message) => {
                    out.push(message);
                    // Flush data buffered while the birth was blocked.
                    if let Some(buffered) = self.pending.remove(device_id) {
                        for batch in buffered {
                            if let Some(message) = self.ddata(device_id, &batch, now_ms)? {
                                out.push(message);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(device_id, error = %e, "Alias store failed, buffering DBIRTH");
                    self.pending
                        .entry(device_id.to_string())
                        .or_default()
                        .push_back(changed.to_vec());
                    return Ok(out);
                }
            }
        } else if let Some(message) = self.ddata(device_id, changed, now_ms)? {
            out.push(message);
        }

        Ok(out)
    }

    fn dbirth(
        &mut self,
        device_id: &str,
        all: &[LeafRecord],
        now_ms: i64,
    ) -> Result<Outbound, StateError> {
        // Aliases are committed before the DBIRTH announces them.
        let edge_node = self.edge_node().to_string();
        let mut aliased = Vec::with_capacity(all.len());
        for record in all {
            let alias =
                self.store
                    .alias(&edge_node, device_id, &record.qualified_name())?;
            aliased.push((record, alias));
        }

        let seq = self.next_seq();
        let mut builder = PayloadBuilder::new(now_ms.max(0) as u64).seq(seq);
        for (record, alias) in aliased {
            builder = builder.birth_metric(record, alias);
        }
        let payload = builder.build();
        let topic = self.scheme.device(SparkplugMessageType::Dbirth, device_id);

        self.store
            .store_birth(&edge_node, device_id, &topic, &payload)?;
        self.devices.insert(device_id.to_string());
        tracing::info!(device_id, metrics = all.len(), "Published DBIRTH");

        Ok(Outbound { topic, payload })
    }

    fn ddata(
        &mut self,
        device_id: &str,
        changed: &[LeafRecord],
        now_ms: i64,
    ) -> Result<Option<Outbound>, StateError> {
        if changed.is_empty() {
            return Ok(None);
        }

        let edge_node = self.edge_node().to_string();
        let mut aliased = Vec::with_capacity(changed.len());
        for record in changed {
            let alias =
                self.store
                    .alias(&edge_node, device_id, &record.qualified_name())?;
            aliased.push((record, alias));
        }

        let seq = self.next_seq();
        let mut builder = PayloadBuilder::new(now_ms.max(0) as u64).seq(seq);
        for (record, alias) in aliased {
            builder = builder.data_metric(record, alias);
        }

        Ok(Some(Outbound {
            topic: self.scheme.device(SparkplugMessageType::Ddata, device_id),
            payload: builder.build(),
        }))
    }

    /// A device went quiet beyond its stale threshold: DDEATH and removal
    /// from the active set and birth cache.
    ///
    /// # Errors
    ///
    /// Returns error if the birth cache delete fails.
    pub fn on_device_offline(
        &mut self,
        device_id: &str,
        now_ms: i64,
    ) -> Result<Option<Outbound>, StateError> {
        if !self.devices.remove(device_id) {
            return Ok(None);
        }
        let edge_node = self.edge_node().to_string();
        self.store.remove_birth(&edge_node, device_id)?;
        let seq = self.next_seq();
        tracing::info!(device_id, "Published DDEATH");
        Ok(Some(Outbound {
            topic: self.scheme.device(SparkplugMessageType::Ddeath, device_id),
            payload: PayloadBuilder::new(now_ms.max(0) as u64).seq(seq).build(),
        }))
    }

    /// Handle a rebirth command: new `bdSeq`, seq reset, NBIRTH, DBIRTHs
    /// from the birth cache. The metric-name→alias maps are unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub fn on_rebirth(&mut self, now_ms: i64) -> Result<Vec<Outbound>, StateError> {
        let edge_node = self.edge_node().to_string();
        let bd_seq = self.store.peek_next_bd_seq(&edge_node)?;
        self.store.commit_bd_seq(&edge_node, bd_seq)?;
        self.bd_seq = bd_seq;
        self.seq = 0;
        self.devices.clear();

        let mut out = vec![self.nbirth(now_ms)];
        out.extend(self.rebirth_devices()?);
        tracing::info!(bd_seq, "Rebirth complete");
        Ok(out)
    }

    /// Graceful shutdown: DDEATH per active device, then an explicit NDEATH
    /// (a graceful disconnect does not fire the will).
    ///
    /// # Errors
    ///
    /// Returns error if the birth cache fails.
    pub fn on_shutdown(&mut self, now_ms: i64) -> Result<Vec<Outbound>, StateError> {
        let mut out = Vec::new();
        let mut devices: Vec<String> = self.devices.iter().cloned().collect();
        devices.sort();
        for device_id in devices {
            // Shutdown deaths leave the birth cache intact so the next
            // session can rebirth the same devices.
            self.devices.remove(&device_id);
            let seq = self.next_seq();
            out.push(Outbound {
                topic: self.scheme.device(SparkplugMessageType::Ddeath, &device_id),
                payload: PayloadBuilder::new(now_ms.max(0) as u64).seq(seq).build(),
            });
        }
        out.push(Outbound {
            topic: self.scheme.node(SparkplugMessageType::Ndeath),
            payload: ndeath_payload(self.bd_seq, now_ms.max(0) as u64),
        });
        self.online = false;
        Ok(out)
    }

    /// The broker connection dropped; the will covers NDEATH.
    pub fn on_disconnect(&mut self) {
        self.online = false;
        self.devices.clear();
        tracing::warn!("Sparkplug session lost");
    }

    /// Session `bdSeq` (full width; wire messages carry it modulo 256).
    #[must_use]
    pub fn bd_seq(&self) -> u64 {
        self.bd_seq
    }

    /// Devices with an active DBIRTH.
    #[must_use]
    pub fn active_devices(&self) -> usize {
        self.devices.len()
    }

    /// True after NBIRTH and before disconnect or shutdown.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }
}

/// Re-envelope a cached payload with a fresh session `seq`.
fn reseq_payload(payload: &[u8], seq: u8) -> Option<Vec<u8>> {
    use prost::Message;
    let mut decoded = aas_uplink_proto::Payload::decode(payload).ok()?;
    decoded.seq = Some(u64::from(seq));
    Some(decoded.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aas_uplink_core::{LeafKind, MetricValue};
    use aas_uplink_proto::payload::{decode_metric_value, decode_payload, BDSEQ_METRIC};

    fn record(path: &str, value: MetricValue) -> LeafRecord {
        LeafRecord {
            asset_uri: "urn:example:asset:robot7".into(),
            submodel_id: "urn:example:sm:tech".into(),
            submodel_id_short: "TechData".into(),
            path: vec![path.to_string()],
            kind: LeafKind::Property,
            value,
            value_type: "xs:double".into(),
            semantic_id: None,
            unit: None,
            submodel_semantic_id: None,
            source_timestamp_ms: 1_000,
            origin_uri: String::new(),
        }
    }

    fn session() -> SparkplugSession {
        SparkplugSession::new(
            SparkplugConfig::default(),
            SparkplugStore::in_memory().unwrap(),
        )
    }

    fn seq_of(message: &Outbound) -> u64 {
        decode_payload(&message.payload).unwrap().seq.unwrap()
    }

    fn bd_seq_of(message: &Outbound) -> MetricValue {
        let payload = decode_payload(&message.payload).unwrap();
        let metric = payload
            .metrics
            .iter()
            .find(|m| m.name.as_deref() == Some(BDSEQ_METRIC))
            .expect("bdSeq metric");
        decode_metric_value(metric)
    }

    #[test]
    fn fresh_start_births_then_data() {
        let mut session = session();

        let out = session.on_connect(1_000).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "spBv1.0/AAS/NBIRTH/Uplink");
        assert_eq!(seq_of(&out[0]), 0);
        assert_eq!(bd_seq_of(&out[0]), MetricValue::Int(0));

        let all = vec![
            record("Serial", MetricValue::Text("AB123456".into())),
            record("Temp", MetricValue::Float(25.5)),
        ];
        let out = session.on_device_data("Robot7", &all, &all, 2_000).unwrap();
        // First sight: DBIRTH only, data carried by the birth itself.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "spBv1.0/AAS/DBIRTH/Uplink/Robot7");
        assert_eq!(seq_of(&out[0]), 1);

        let birth = decode_payload(&out[0].payload).unwrap();
        let aliases: Vec<(Option<String>, u64)> = birth
            .metrics
            .iter()
            .map(|m| (m.name.clone(), m.alias.unwrap()))
            .collect();
        assert_eq!(aliases[0], (Some("TechData.Serial".to_string()), 0));
        assert_eq!(aliases[1], (Some("TechData.Temp".to_string()), 1));
    }

    #[test]
    fn changed_metric_flows_as_alias_only_ddata() {
        let mut session = session();
        session.on_connect(1_000).unwrap();

        let all = vec![
            record("Serial", MetricValue::Text("AB123456".into())),
            record("Temp", MetricValue::Float(25.5)),
        ];
        session.on_device_data("Robot7", &all, &all, 2_000).unwrap();

        let changed = vec![record("Temp", MetricValue::Float(26.0))];
        let out = session.on_device_data("Robot7", &all, &changed, 3_000).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "spBv1.0/AAS/DDATA/Uplink/Robot7");
        assert_eq!(seq_of(&out[0]), 2);

        let data = decode_payload(&out[0].payload).unwrap();
        assert_eq!(data.metrics.len(), 1);
        assert_eq!(data.metrics[0].name, None);
        assert_eq!(data.metrics[0].alias, Some(1));
        assert_eq!(decode_metric_value(&data.metrics[0]), MetricValue::Float(26.0));
    }

    #[test]
    fn unchanged_batch_sends_nothing() {
        let mut session = session();
        session.on_connect(1_000).unwrap();
        let all = vec![record("Temp", MetricValue::Float(25.5))];
        session.on_device_data("Robot7", &all, &all, 2_000).unwrap();

        let out = session.on_device_data("Robot7", &all, &[], 3_000).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn seq_is_gap_free_and_wraps() {
        let mut session = session();
        session.on_connect(1_000).unwrap();
        let all = vec![record("Temp", MetricValue::Float(0.0))];
        session.on_device_data("Robot7", &all, &all, 1_000).unwrap();

        let mut expected: u64 = 2;
        for i in 0..600u32 {
            let changed = vec![record("Temp", MetricValue::Float(f64::from(i)))];
            let out = session.on_device_data("Robot7", &all, &changed, 1_000).unwrap();
            assert_eq!(seq_of(&out[0]), expected % 256);
            expected += 1;
        }
    }

    #[test]
    fn reconnect_increments_bd_seq_and_restores_devices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparkplug.db");

        let pre_rebirth_aliases;
        {
            let store = SparkplugStore::open(&path, 1000).unwrap();
            let mut session = SparkplugSession::new(SparkplugConfig::default(), store);
            session.on_connect(1_000).unwrap();
            let all = vec![
                record("Serial", MetricValue::Text("A".into())),
                record("Temp", MetricValue::Float(1.0)),
            ];
            session.on_device_data("Robot7", &all, &all, 2_000).unwrap();
            pre_rebirth_aliases = {
                let store2 = SparkplugStore::open(&path, 1000).unwrap();
                store2.device_aliases("Uplink", "Robot7")
            };
        }

        // New process, same store: bdSeq advances, DBIRTH restored from cache.
        let store = SparkplugStore::open(&path, 1000).unwrap();
        let mut session = SparkplugSession::new(SparkplugConfig::default(), store);
        let out = session.on_connect(5_000).unwrap();

        assert_eq!(bd_seq_of(&out[0]), MetricValue::Int(1));
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].topic, "spBv1.0/AAS/DBIRTH/Uplink/Robot7");
        assert_eq!(seq_of(&out[1]), 1);
        assert_eq!(session.active_devices(), 1);

        // Alias map is bit-identical to the pre-restart map.
        let birth = decode_payload(&out[1].payload).unwrap();
        for metric in &birth.metrics {
            let name = metric.name.clone().unwrap();
            assert_eq!(metric.alias, pre_rebirth_aliases.get(&name).copied());
        }
    }

    #[test]
    fn rebirth_command_renews_session_keeps_aliases() {
        let mut session = session();
        session.on_connect(1_000).unwrap();
        let all = vec![
            record("Serial", MetricValue::Text("A".into())),
            record("Temp", MetricValue::Float(1.0)),
        ];
        session.on_device_data("Robot7", &all, &all, 2_000).unwrap();

        let out = session.on_rebirth(3_000).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(bd_seq_of(&out[0]), MetricValue::Int(1));
        assert_eq!(seq_of(&out[0]), 0);
        assert_eq!(out[1].topic, "spBv1.0/AAS/DBIRTH/Uplink/Robot7");

        let birth = decode_payload(&out[1].payload).unwrap();
        let aliases: Vec<u64> = birth.metrics.iter().map(|m| m.alias.unwrap()).collect();
        assert_eq!(aliases, vec![0, 1]);
    }

    #[test]
    fn device_offline_emits_ddeath_once() {
        let mut session = session();
        session.on_connect(1_000).unwrap();
        let all = vec![record("Temp", MetricValue::Float(1.0))];
        session.on_device_data("Robot7", &all, &all, 2_000).unwrap();

        let death = session.on_device_offline("Robot7", 3_000).unwrap().unwrap();
        assert_eq!(death.topic, "spBv1.0/AAS/DDEATH/Uplink/Robot7");
        assert!(session.on_device_offline("Robot7", 4_000).unwrap().is_none());
        assert_eq!(session.active_devices(), 0);
    }

    #[test]
    fn shutdown_deaths_then_ndeath_with_session_bd_seq() {
        let mut session = session();
        session.on_connect(1_000).unwrap();
        let all = vec![record("Temp", MetricValue::Float(1.0))];
        session.on_device_data("Robot7", &all, &all, 2_000).unwrap();
        session.on_device_data("Press02", &all, &all, 2_000).unwrap();

        let out = session.on_shutdown(9_000).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].topic.starts_with("spBv1.0/AAS/DDEATH/"));
        assert!(out[1].topic.starts_with("spBv1.0/AAS/DDEATH/"));
        assert_eq!(out[2].topic, "spBv1.0/AAS/NDEATH/Uplink");
        assert_eq!(bd_seq_of(&out[2]), MetricValue::Int(0));
        assert!(!session.is_online());
    }

    #[test]
    fn will_matches_next_session_bd_seq() {
        let mut session = session();
        let (topic, payload) = session.will(1_000).unwrap();
        assert_eq!(topic, "spBv1.0/AAS/NDEATH/Uplink");
        let decoded = decode_payload(&payload).unwrap();
        assert_eq!(
            decode_metric_value(
                decoded
                    .metrics
                    .iter()
                    .find(|m| m.name.as_deref() == Some(BDSEQ_METRIC))
                    .unwrap()
            ),
            MetricValue::Int(0)
        );

        // NBIRTH of the established session carries the same value.
        let out = session.on_connect(2_000).unwrap();
        assert_eq!(bd_seq_of(&out[0]), MetricValue::Int(0));
    }

    #[test]
    fn data_before_nbirth_is_buffered() {
        let mut session = session();
        let all = vec![record("Temp", MetricValue::Float(1.0))];
        let out = session.on_device_data("Robot7", &all, &all, 500).unwrap();
        assert!(out.is_empty());

        session.on_connect(1_000).unwrap();
        let out = session.on_device_data("Robot7", &all, &all, 2_000).unwrap();
        // DBIRTH plus the flushed buffered batch.
        assert_eq!(out[0].topic, "spBv1.0/AAS/DBIRTH/Uplink/Robot7");
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].topic, "spBv1.0/AAS/DDATA/Uplink/Robot7");
    }
}
