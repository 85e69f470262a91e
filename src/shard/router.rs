use std::sync::Arc;
use tracing::debug;

use super::map::{
    ShardKeyValue, ShardMapRecord, ShardMapStore, FLAG_BAD_LOGICAL, FLAG_READ_STATUS_N,
    FLAG_WRITE_STATUS_N,
};
use crate::config::{ShardingAlgo, ShardingConfig};
use crate::error::MuxError;
use crate::protocol::sql::murmur3_32;
use crate::protocol::{codes, Frame};
use crate::telemetry::{Event, EventKind, EventSink};

/// Routing state of one client session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardContext {
    /// Raw shard key values of the current statement
    pub values: Vec<String>,
    pub records: Vec<ShardMapRecord>,
    /// Shard pinned with SET_SHARD_ID, -1 when unset
    pub session_shard_id: i32,
    pub shard_id: usize,
    pub sqlhash: u32,
}

impl Default for ShardContext {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            records: Vec::new(),
            session_shard_id: -1,
            shard_id: 0,
            sqlhash: 0,
        }
    }
}

impl ShardContext {
    fn reset_keeping_session(&mut self, session_shard_id: i32) {
        *self = ShardContext {
            session_shard_id,
            sqlhash: self.sqlhash,
            ..Default::default()
        };
    }
}

/// A request the router refuses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRejection {
    pub error: MuxError,
    /// Close the client session after replying
    pub hangup: bool,
}

impl ShardRejection {
    fn new(error: MuxError, hangup: bool) -> Self {
        Self { error, hangup }
    }
}

/// Resolves statements to logical shards
pub struct ShardRouter {
    settings: ShardingConfig,
    store: Arc<ShardMapStore>,
    sink: Arc<dyn EventSink>,
}

impl ShardRouter {
    pub fn new(settings: ShardingConfig, store: Arc<ShardMapStore>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            settings,
            store,
            sink,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn num_shards(&self) -> usize {
        if self.settings.enabled {
            self.settings.num_shards
        } else {
            1
        }
    }

    pub fn store(&self) -> &Arc<ShardMapStore> {
        &self.store
    }

    fn no_map_lookup(&self) -> bool {
        self.settings.whitelist_enabled || !self.settings.use_shard_map
    }

    fn emit(&self, name: &str, sqlhash: u32) {
        self.sink
            .emit(Event::new(EventKind::Sharding, name).with("sql", sqlhash));
    }

    /// Handle SET_SHARD_ID. `txn_worker_shard` is the shard of the worker
    /// held by an open transaction.
    pub fn set_shard_id(
        &self,
        ctx: &mut ShardContext,
        payload: &str,
        txn_worker_shard: Option<usize>,
    ) -> Result<(), MuxError> {
        let parsed = payload.trim().parse::<i32>();
        if !self.settings.enabled {
            return match parsed {
                Ok(0) | Ok(-1) => Ok(()),
                _ => Err(MuxError::BadShardId),
            };
        }

        let id = match parsed {
            Ok(id) if id >= -1 && (id as i64) < self.settings.num_shards as i64 => id,
            _ => {
                self.sink.emit(
                    Event::new(EventKind::Sharding, "bad_shard_id")
                        .warning()
                        .with("value", payload),
                );
                return Err(MuxError::BadShardId);
            }
        };

        let effective = if id == -1 { 0 } else { id as usize };
        if let Some(worker_shard) = txn_worker_shard {
            if worker_shard != effective {
                self.sink.emit(
                    Event::new(EventKind::Sharding, "set_shard_id_in_txn")
                        .warning()
                        .with("from", worker_shard)
                        .with("to", id),
                );
                return Err(MuxError::ChangeShardIdInTxn);
            }
        }

        ctx.session_shard_id = id;
        ctx.shard_id = effective;
        debug!(shard_id = id, "session shard id set");
        Ok(())
    }

    /// Parse a SHARD_KEY payload, `name=v1;v2`. A backslash escapes the
    /// next character. The name is lowercased.
    pub fn parse_shard_key(payload: &str) -> Option<(String, Vec<String>)> {
        let (name, rest) = payload.split_once('=')?;
        let mut values = Vec::new();
        let mut cur = String::new();
        let mut chars = rest.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        cur.push(next);
                    }
                }
                ';' => values.push(std::mem::take(&mut cur)),
                _ => cur.push(c),
            }
        }
        values.push(cur);
        Some((name.trim().to_lowercase(), values))
    }

    /// Bind name refers to the shard key: `:name`, `name` or `name_<n>`,
    /// case-insensitively
    pub fn is_shard_key(&self, bind: &str) -> bool {
        let key = &self.settings.shard_key_name;
        if key.is_empty() {
            return false;
        }
        let bind = bind.strip_prefix(':').unwrap_or(bind).to_lowercase();
        let Some(rest) = bind.strip_prefix(key.as_str()) else {
            return false;
        };
        match rest.strip_prefix('_') {
            None => rest.is_empty(),
            Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        }
    }

    pub fn key_value(&self, raw: &str) -> ShardKeyValue {
        ShardKeyValue::parse(raw, self.settings.key_value_type_is_string)
    }

    /// Bucket of a shard key value
    pub fn bucket(&self, key: &ShardKeyValue) -> usize {
        let raw = match (self.settings.algo, key) {
            (ShardingAlgo::Mod, ShardKeyValue::Num(n)) => *n,
            (_, ShardKeyValue::Num(n)) => u64::from(murmur3_32(&n.to_le_bytes(), 0)),
            (_, ShardKeyValue::Str(s)) => u64::from(murmur3_32(s.as_bytes(), 0)),
        };
        (raw % self.settings.max_scuttle.max(1) as u64) as usize
    }

    /// Map record for a raw shard key value
    pub fn shard_record(&self, raw: &str) -> ShardMapRecord {
        let bucket = self.bucket(&self.key_value(raw));
        let mut rec = self.store.map().record(bucket);
        rec.bucket = bucket;
        rec
    }

    /// Fill `ctx.records` from `ctx.values` and pick the shard
    pub fn compute_logical_shards(&self, ctx: &mut ShardContext) {
        ctx.records.clear();
        let whitelist = self.store.whitelist();
        let mut idx = 0;
        while idx < ctx.values.len() {
            let raw = &ctx.values[idx];
            if raw.is_empty() && self.settings.whitelist_enabled {
                ctx.records.push(ShardMapRecord::logical(0));
                break;
            }
            if self.no_map_lookup() {
                if idx > 0 {
                    self.emit("multi_shard", ctx.sqlhash);
                    ctx.values.truncate(1);
                    break;
                }
                if let Some(rec) = whitelist.get(&self.key_value(raw)) {
                    if rec.logical >= 0 && (rec.logical as usize) < self.settings.num_shards {
                        ctx.records.push(rec);
                        idx += 1;
                        continue;
                    }
                }
            }
            if self.no_map_lookup() && !self.settings.use_shard_map {
                ctx.records.push(ShardMapRecord::logical(0));
            } else {
                ctx.records.push(self.shard_record(raw));
            }
            idx += 1;
        }

        match ctx.records.first() {
            Some(rec) if rec.logical >= 0 => ctx.shard_id = rec.logical as usize,
            Some(_) => {}
            None => ctx.values.clear(),
        }
    }

    /// Decide the shard of a request. On rejection both contexts are put
    /// back as they were.
    pub fn preprocess(
        &self,
        cur: &mut ShardContext,
        prev: &mut ShardContext,
        frames: &[Frame],
        sqlhash: u32,
        is_read: bool,
        in_txn: bool,
    ) -> Result<(), ShardRejection> {
        let cur_entry = cur.clone();
        let prev_entry = prev.clone();
        cur.sqlhash = sqlhash;
        let result = self.route(cur, prev, frames, is_read, in_txn);
        if result.is_err() {
            *cur = cur_entry;
            *prev = prev_entry;
        }
        result
    }

    fn route(
        &self,
        cur: &mut ShardContext,
        prev: &mut ShardContext,
        frames: &[Frame],
        is_read: bool,
        in_txn: bool,
    ) -> Result<(), ShardRejection> {
        if in_txn {
            *prev = cur.clone();
        } else {
            prev.session_shard_id = cur.session_shard_id;
        }
        cur.values.clear();
        cur.records.clear();

        let scuttle_col = self.settings.scuttle_col_name.to_lowercase();
        let mut autodisc = false;
        let mut i = 0;
        while i < frames.len() {
            let frame = &frames[i];
            if codes::is_prepare(frame.cmd) {
                let sql = frame.payload_str().to_lowercase();
                let selects_scuttle = match (sql.rfind(&scuttle_col), sql.find(" from ")) {
                    (Some(col), Some(from)) => !scuttle_col.is_empty() && col <= from,
                    _ => false,
                };
                if selects_scuttle {
                    self.emit("rm_scuttle_id_fetch_col", cur.sqlhash);
                    return Err(ShardRejection::new(MuxError::NoScuttleIdPredicate, true));
                }
            } else if frame.cmd == codes::BIND_NAME && self.is_shard_key(&frame.payload_str()) {
                if cur.session_shard_id != -1 {
                    self.emit("autodisc_while_set_shard_id", cur.sqlhash);
                    return Err(ShardRejection::new(MuxError::AutodiscoverWhileSetShardId, true));
                }
                if !autodisc {
                    let session = prev.session_shard_id;
                    cur.reset_keeping_session(session);
                }
                let value = match (frames.get(i + 1), frames.get(i + 3)) {
                    (Some(n), Some(v))
                        if n.cmd == codes::BIND_NUM
                            && frames[i + 2].cmd == codes::BIND_VALUE_MAX_SIZE
                            && v.cmd == codes::BIND_VALUE =>
                    {
                        i += 3;
                        v
                    }
                    (Some(v), _) if v.cmd == codes::BIND_VALUE => {
                        i += 1;
                        v
                    }
                    _ => return Err(ShardRejection::new(MuxError::NoShardValue, false)),
                };
                cur.values.push(value.payload_str().into_owned());
                autodisc = true;
            } else if frame.cmd == codes::SHARD_KEY {
                if cur.session_shard_id != -1 {
                    return Err(ShardRejection::new(MuxError::ShardIdAndKey, true));
                }
                let parsed = Self::parse_shard_key(&frame.payload_str());
                let Some((name, values)) = parsed else {
                    return Err(ShardRejection::new(MuxError::NoShardKey, false));
                };
                if name != self.settings.shard_key_name && !self.no_map_lookup() {
                    return Err(ShardRejection::new(MuxError::NoShardKey, false));
                }
                cur.values = values;
                self.compute_logical_shards(cur);
                if cur.records.len() > 1 {
                    self.emit("multi_shard", cur.sqlhash);
                }
                autodisc = false;
                break;
            }
            i += 1;
        }

        if autodisc {
            self.compute_logical_shards(cur);
            self.emit("shard_key_auto_discovery", cur.sqlhash);
        }

        if cur.values.is_empty() && cur.session_shard_id == -1 && self.no_map_lookup() {
            cur.records = vec![ShardMapRecord::logical(0)];
            cur.shard_id = 0;
        }

        if cur.session_shard_id == -1 {
            self.verify_valid_shard(cur, is_read)?;
        }

        if in_txn {
            self.verify_cross_shard(cur, prev, is_read)?;
        }
        Ok(())
    }

    fn verify_valid_shard(&self, cur: &mut ShardContext, is_read: bool) -> Result<(), ShardRejection> {
        if let Some(first) = cur.records.first().copied() {
            let out_of_range = first.logical < 0 || first.logical as usize >= self.settings.num_shards;
            if first.flags & FLAG_BAD_LOGICAL != 0 || out_of_range {
                if self.settings.whitelist_enabled {
                    cur.records[0] = ShardMapRecord::logical(0);
                    cur.shard_id = 0;
                } else {
                    self.emit("bad_logical_shard", cur.sqlhash);
                    return Err(ShardRejection::new(
                        MuxError::NoShardKey,
                        first.flags & FLAG_BAD_LOGICAL != 0,
                    ));
                }
            }
        }

        if cur.values.len() > 1 || cur.records.is_empty() {
            self.emit("no_shard_key", cur.sqlhash);
            return Err(ShardRejection::new(MuxError::NoShardKey, false));
        }

        let flags = cur.records[0].flags;
        if is_read && flags & FLAG_READ_STATUS_N != 0 {
            self.emit("scuttle_mkd_r", cur.sqlhash);
            return Err(ShardRejection::new(MuxError::ScuttleMarkdownRead, true));
        }
        if !is_read && flags & FLAG_WRITE_STATUS_N != 0 {
            self.emit("scuttle_mkd_w", cur.sqlhash);
            return Err(ShardRejection::new(MuxError::ScuttleMarkdownWrite, true));
        }
        Ok(())
    }

    fn verify_cross_shard(
        &self,
        cur: &ShardContext,
        prev: &ShardContext,
        is_read: bool,
    ) -> Result<(), ShardRejection> {
        if is_read {
            return Ok(());
        }
        if let (Some(a), Some(b)) = (prev.values.first(), cur.values.first()) {
            if a != b {
                self.emit("cross_keys_txn", cur.sqlhash);
                if self.settings.cross_keys_err {
                    return Err(ShardRejection::new(MuxError::CrossKeysDml, true));
                }
            }
        }
        if let Some(rec) = cur.records.first() {
            if prev.shard_id as i64 != i64::from(rec.logical) {
                self.sink.emit(
                    Event::new(EventKind::Sharding, "cross_shard_dml")
                        .warning()
                        .with("sql", cur.sqlhash)
                        .with("from", prev.shard_id)
                        .with("to", rec.logical),
                );
                return Err(ShardRejection::new(MuxError::CrossShardDml, true));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::map::{ShardMap, ShardMapEntry, Whitelist, WhitelistEntry};
    use crate::telemetry::MemorySink;

    fn settings() -> ShardingConfig {
        ShardingConfig {
            enabled: true,
            num_shards: 4,
            max_scuttle: 16,
            shard_key_name: "accountid".to_string(),
            algo: ShardingAlgo::Mod,
            ..Default::default()
        }
    }

    fn router_with(settings: ShardingConfig) -> (ShardRouter, Arc<MemorySink>) {
        let store = Arc::new(ShardMapStore::from_settings(&settings));
        let sink = Arc::new(MemorySink::new());
        (ShardRouter::new(settings, store, sink.clone()), sink)
    }

    fn request(key: &str, value: &str) -> Vec<Frame> {
        vec![
            Frame::new(codes::PREPARE, "update acct set x = 1 where accountid = :accountid"),
            Frame::new(codes::BIND_NAME, key.to_string()),
            Frame::new(codes::BIND_VALUE, value.to_string()),
            Frame::empty(codes::EXECUTE),
        ]
    }

    #[test]
    fn test_is_shard_key() {
        let (router, _) = router_with(settings());
        assert!(router.is_shard_key(":AccountID"));
        assert!(router.is_shard_key("accountid_12"));
        assert!(!router.is_shard_key("accountid_"));
        assert!(!router.is_shard_key("accountidx"));
        assert!(!router.is_shard_key("id"));
    }

    #[test]
    fn test_parse_shard_key_escapes() {
        let (name, values) = ShardRouter::parse_shard_key("AccountId=1;a\\;b;3").unwrap();
        assert_eq!(name, "accountid");
        assert_eq!(values, vec!["1", "a;b", "3"]);
        assert!(ShardRouter::parse_shard_key("novalue").is_none());
    }

    #[test]
    fn test_mod_routing_uses_uniform_map() {
        let (router, sink) = router_with(settings());
        let mut cur = ShardContext::default();
        let mut prev = ShardContext::default();

        router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "7"), 1, false, false)
            .unwrap();
        assert_eq!(cur.records[0].bucket, 7);
        assert_eq!(cur.shard_id, 3);
        assert_eq!(sink.count("shard_key_auto_discovery"), 1);
    }

    #[test]
    fn test_missing_key_rejected_and_context_restored() {
        let (router, _) = router_with(settings());
        let mut cur = ShardContext {
            shard_id: 2,
            ..Default::default()
        };
        let mut prev = ShardContext::default();
        let before = cur.clone();

        let frames = vec![Frame::new(codes::PREPARE, "select 1 from dual")];
        let err = router
            .preprocess(&mut cur, &mut prev, &frames, 5, true, false)
            .unwrap_err();
        assert_eq!(err.error, MuxError::NoShardKey);
        assert!(!err.hangup);
        assert_eq!(cur, before);
    }

    #[test]
    fn test_more_than_one_key_value_rejected() {
        let (router, sink) = router_with(settings());
        let mut cur = ShardContext::default();
        let mut prev = ShardContext::default();
        router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "2"), 3, false, false)
            .unwrap();
        let before = cur.clone();
        let prev_before = prev.clone();

        let frames = vec![
            Frame::new(codes::SHARD_KEY, "accountid=1;3"),
            Frame::new(codes::PREPARE, "select a from t"),
        ];
        let err = router
            .preprocess(&mut cur, &mut prev, &frames, 4, true, false)
            .unwrap_err();
        assert_eq!(err.error, MuxError::NoShardKey);
        assert!(!err.hangup);
        assert_eq!(sink.count("multi_shard"), 1);
        assert_eq!(cur, before);
        assert_eq!(prev, prev_before);

        // two shard-key binds in one statement are refused the same way
        let frames = vec![
            Frame::new(codes::PREPARE, "select a from t where accountid in (:accountid_1, :accountid_2)"),
            Frame::new(codes::BIND_NAME, ":accountid_1"),
            Frame::new(codes::BIND_VALUE, "1"),
            Frame::new(codes::BIND_NAME, ":accountid_2"),
            Frame::new(codes::BIND_VALUE, "3"),
            Frame::empty(codes::EXECUTE),
        ];
        let err = router
            .preprocess(&mut cur, &mut prev, &frames, 5, true, false)
            .unwrap_err();
        assert_eq!(err.error, MuxError::NoShardKey);
        assert_eq!(cur, before);
    }

    #[test]
    fn test_cross_key_dml_rejected_when_configured() {
        let s = ShardingConfig {
            cross_keys_err: true,
            ..settings()
        };
        let (router, sink) = router_with(s);
        let mut cur = ShardContext::default();
        let mut prev = ShardContext::default();

        router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "1"), 9, false, false)
            .unwrap();
        let before = cur.clone();

        // bucket 5 lives on the same shard, but the key differs
        let err = router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "5"), 9, false, true)
            .unwrap_err();
        assert_eq!(err.error, MuxError::CrossKeysDml);
        assert!(err.hangup);
        assert_eq!(sink.count("cross_keys_txn"), 1);
        assert_eq!(sink.count("cross_shard_dml"), 0);
        assert_eq!(cur, before);

        // reads may use another key
        router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "5"), 9, true, true)
            .unwrap();
        assert_eq!(cur.shard_id, 1);
    }

    #[test]
    fn test_shard_key_with_set_shard_id_hangs_up() {
        let (router, _) = router_with(settings());
        let mut cur = ShardContext::default();
        let mut prev = ShardContext::default();
        router.set_shard_id(&mut cur, "1", None).unwrap();

        let frames = vec![
            Frame::new(codes::SHARD_KEY, "accountid=5"),
            Frame::new(codes::PREPARE, "select a from t"),
        ];
        let err = router
            .preprocess(&mut cur, &mut prev, &frames, 0, true, false)
            .unwrap_err();
        assert_eq!(err.error, MuxError::ShardIdAndKey);
        assert!(err.hangup);
        assert_eq!(cur.session_shard_id, 1);
    }

    #[test]
    fn test_set_shard_id_bounds() {
        let (router, sink) = router_with(settings());
        let mut ctx = ShardContext::default();

        assert_eq!(router.set_shard_id(&mut ctx, "4", None), Err(MuxError::BadShardId));
        assert_eq!(router.set_shard_id(&mut ctx, "-2", None), Err(MuxError::BadShardId));
        assert_eq!(router.set_shard_id(&mut ctx, "abc", None), Err(MuxError::BadShardId));
        assert_eq!(sink.count("bad_shard_id"), 3);

        router.set_shard_id(&mut ctx, "3", None).unwrap();
        assert_eq!(ctx.shard_id, 3);
        assert_eq!(
            router.set_shard_id(&mut ctx, "1", Some(3)),
            Err(MuxError::ChangeShardIdInTxn)
        );
        assert_eq!(ctx.shard_id, 3);

        router.set_shard_id(&mut ctx, "-1", None).unwrap();
        assert_eq!(ctx.session_shard_id, -1);
        assert_eq!(ctx.shard_id, 0);
    }

    #[test]
    fn test_set_shard_id_when_disabled() {
        let (router, _) = router_with(ShardingConfig::default());
        let mut ctx = ShardContext::default();
        assert!(router.set_shard_id(&mut ctx, "0", None).is_ok());
        assert!(router.set_shard_id(&mut ctx, "-1", None).is_ok());
        assert_eq!(router.set_shard_id(&mut ctx, "1", None), Err(MuxError::BadShardId));
    }

    #[test]
    fn test_scuttle_column_select_rejected() {
        let (router, _) = router_with(settings());
        let mut cur = ShardContext::default();
        let mut prev = ShardContext::default();
        let frames = vec![Frame::new(codes::PREPARE, "select scuttle_id, a from t where accountid = :accountid")];
        let err = router
            .preprocess(&mut cur, &mut prev, &frames, 0, true, false)
            .unwrap_err();
        assert_eq!(err.error, MuxError::NoScuttleIdPredicate);
        assert!(err.hangup);
    }

    #[test]
    fn test_cross_shard_write_in_txn() {
        let (router, sink) = router_with(settings());
        let mut cur = ShardContext::default();
        let mut prev = ShardContext::default();

        router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "1"), 9, false, false)
            .unwrap();
        assert_eq!(cur.shard_id, 1);

        let err = router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "2"), 9, false, true)
            .unwrap_err();
        assert_eq!(err.error, MuxError::CrossShardDml);
        assert!(err.hangup);
        assert_eq!(cur.shard_id, 1);
        assert_eq!(sink.count("cross_shard_dml"), 1);
        assert_eq!(sink.count("cross_keys_txn"), 1);

        // same shard, different key: allowed unless cross_keys_err
        router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "5"), 9, false, true)
            .unwrap();
        assert_eq!(cur.shard_id, 1);
    }

    #[test]
    fn test_markdown_write() {
        let s = settings();
        let store = Arc::new(ShardMapStore::from_settings(&s));
        let entries: Vec<ShardMapEntry> = (0..16)
            .map(|b| ShardMapEntry {
                bucket: b,
                shard: (b % 4) as i32,
                read_status: None,
                write_status: (b == 6).then(|| "N".to_string()),
            })
            .collect();
        store.replace_map(ShardMap::build(&entries, 16, 4).0);
        let router = ShardRouter::new(s, store, Arc::new(MemorySink::new()));

        let mut cur = ShardContext::default();
        let mut prev = ShardContext::default();
        let err = router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "6"), 0, false, false)
            .unwrap_err();
        assert_eq!(err.error, MuxError::ScuttleMarkdownWrite);
    }

    #[test]
    fn test_whitelist_pins_key() {
        let s = ShardingConfig {
            whitelist_enabled: true,
            ..settings()
        };
        let store = Arc::new(ShardMapStore::from_settings(&s));
        store.replace_whitelist(Whitelist::build(
            &[WhitelistEntry {
                key: "7".to_string(),
                shard: 0,
                read_status: None,
                write_status: None,
            }],
            false,
        ));
        let router = ShardRouter::new(s, store, Arc::new(MemorySink::new()));

        let mut cur = ShardContext::default();
        let mut prev = ShardContext::default();
        router
            .preprocess(&mut cur, &mut prev, &request(":accountid", "7"), 0, false, false)
            .unwrap();
        assert_eq!(cur.shard_id, 0);

        // no key at all routes to shard 0 with a whitelist
        let frames = vec![Frame::new(codes::PREPARE, "select 1 from dual")];
        router
            .preprocess(&mut cur, &mut prev, &frames, 0, true, false)
            .unwrap();
        assert_eq!(cur.shard_id, 0);
    }

    #[test]
    fn test_hash_algo_is_stable() {
        let s = ShardingConfig {
            algo: ShardingAlgo::Hash,
            ..settings()
        };
        let (router, _) = router_with(s);
        let expected = (murmur3_32(&42u64.to_le_bytes(), 0) % 16) as usize;
        assert_eq!(router.bucket(&ShardKeyValue::Num(42)), expected);
        assert_eq!(router.shard_record("42").bucket, expected);
    }
}
