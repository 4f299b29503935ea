/* File: reveil/src/store.rs
 *
 * Versioned, atomic persistence for alarm definitions, runtime snapshots,
 * and global settings.
 *
 * The on-disk layout is a single JSON envelope per engine instance:
 * `{version, alarms, runtime_states, settings}`. Writes go through an
 * exclusive file lock and a write-to-temp-then-rename, so a crash mid-write
 * never surfaces a torn file on reload. Unknown keys anywhere in the
 * envelope are preserved for forward compatibility.
 */

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::AppContext;
use crate::model::{Alarm, GlobalSettings, RuntimeState};

pub const STORE_VERSION: u32 = 2;

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreData {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub alarms: BTreeMap<String, Alarm>,
    #[serde(default)]
    pub runtime_states: BTreeMap<String, RuntimeState>,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn get_lock_path(file_path: &Path) -> PathBuf {
    let mut lock_path = file_path.to_path_buf();
    if let Some(ext) = lock_path.extension() {
        let mut new_ext = ext.to_os_string();
        new_ext.push(".lock");
        lock_path.set_extension(new_ext);
    } else {
        lock_path.set_extension("lock");
    }
    lock_path
}

fn with_lock<F, T>(file_path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let lock_path = get_lock_path(file_path);
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    file.lock_exclusive()?;
    let result = f();
    let _ = FileExt::unlock(&file);
    result
}

fn atomic_write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<()> {
    let path = path.as_ref();
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Persistent store for one engine instance.
pub struct EngineStore {
    ctx: Arc<dyn AppContext>,
    data: StoreData,
}

impl EngineStore {
    /// Load the store, tolerating a missing or corrupt file: both cases
    /// yield an empty store (corruption is logged at error level).
    pub fn load(ctx: Arc<dyn AppContext>) -> Self {
        let data = match Self::try_load(ctx.as_ref()) {
            Ok(data) => data,
            Err(err) => {
                log::error!("Failed to load alarm store, starting empty: {:#}", err);
                StoreData {
                    version: STORE_VERSION,
                    ..StoreData::default()
                }
            }
        };
        Self { ctx, data }
    }

    fn try_load(ctx: &dyn AppContext) -> Result<StoreData> {
        let path = ctx.get_store_path()?;
        if !path.exists() {
            log::debug!("No stored data found, using defaults");
            return Ok(StoreData {
                version: STORE_VERSION,
                ..StoreData::default()
            });
        }

        with_lock(&path, || {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("unable to read alarm store {}", path.display()))?;
            let raw: Value = serde_json::from_str(&json)
                .with_context(|| format!("invalid JSON in alarm store {}", path.display()))?;

            let stored_version = raw
                .get("version")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32;
            if stored_version > STORE_VERSION {
                bail!(
                    "alarm store version {} is newer than supported version {}",
                    stored_version,
                    STORE_VERSION
                );
            }

            let raw = if stored_version < STORE_VERSION {
                migrate(raw, stored_version)?
            } else {
                raw
            };

            let data: StoreData = serde_json::from_value(raw)
                .with_context(|| "alarm store envelope does not match schema")?;
            log::debug!("Loaded {} alarms from storage", data.alarms.len());
            Ok(data)
        })
    }

    pub fn save(&self) -> Result<()> {
        let path = self.ctx.get_store_path()?;
        with_lock(&path, || {
            let json = serde_json::to_string_pretty(&self.data)?;
            atomic_write(&path, json)?;
            Ok(())
        })?;
        log::debug!("Saved {} alarms to storage", self.data.alarms.len());
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.data.version
    }

    pub fn alarm_count(&self) -> usize {
        self.data.alarms.len()
    }

    pub fn get_alarm(&self, alarm_id: &str) -> Option<&Alarm> {
        self.data.alarms.get(alarm_id)
    }

    pub fn all_alarms(&self) -> Vec<Alarm> {
        self.data.alarms.values().cloned().collect()
    }

    pub fn contains(&self, alarm_id: &str) -> bool {
        self.data.alarms.contains_key(alarm_id)
    }

    pub fn add_alarm(&mut self, alarm: Alarm) -> Result<()> {
        self.data.alarms.insert(alarm.id.clone(), alarm);
        self.save()
    }

    pub fn update_alarm(&mut self, alarm: Alarm) -> Result<()> {
        if !self.data.alarms.contains_key(&alarm.id) {
            bail!("attempted to update non-existent alarm: {}", alarm.id);
        }
        self.data.alarms.insert(alarm.id.clone(), alarm);
        self.save()
    }

    /// Remove an alarm and its runtime snapshot. Returns false for an
    /// unknown id.
    pub fn remove_alarm(&mut self, alarm_id: &str) -> Result<bool> {
        if self.data.alarms.remove(alarm_id).is_none() {
            return Ok(false);
        }
        self.data.runtime_states.remove(alarm_id);
        self.save()?;
        log::debug!("Removed alarm: {}", alarm_id);
        Ok(true)
    }

    pub fn get_runtime_state(&self, alarm_id: &str) -> Option<&RuntimeState> {
        self.data.runtime_states.get(alarm_id)
    }

    pub fn save_runtime_state(&mut self, alarm_id: &str, state: RuntimeState) -> Result<()> {
        self.data
            .runtime_states
            .insert(alarm_id.to_string(), state);
        self.save()
    }

    /// Batch variant used at shutdown: stage every snapshot, write once.
    pub fn save_runtime_states(
        &mut self,
        states: impl IntoIterator<Item = (String, RuntimeState)>,
    ) -> Result<()> {
        for (alarm_id, state) in states {
            self.data.runtime_states.insert(alarm_id, state);
        }
        self.save()
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.data.settings
    }

    pub fn update_settings(&mut self, settings: GlobalSettings) -> Result<()> {
        self.data.settings = settings;
        self.save()
    }

    /// Clear all stored data (maintenance surface).
    pub fn clear_all(&mut self) -> Result<()> {
        self.data = StoreData {
            version: STORE_VERSION,
            ..StoreData::default()
        };
        self.save()?;
        log::info!("Cleared all alarm storage");
        Ok(())
    }
}

/// Migrate an envelope from `from_version` up to `STORE_VERSION`, one
/// version at a time.
fn migrate(mut raw: Value, from_version: u32) -> Result<Value> {
    log::info!(
        "Migrating alarm store from version {} to {}",
        from_version,
        STORE_VERSION
    );

    // v1 -> v2: alarms moved from a list to a map keyed by id, and the
    // per-alarm `snooze_duration`/`auto_dismiss_timeout`/`pre_alarm_duration`
    // keys gained unit suffixes.
    if from_version < 2 {
        let Some(obj) = raw.as_object_mut() else {
            bail!("alarm store envelope is not an object");
        };
        if let Some(Value::Array(list)) = obj.remove("alarms") {
            let mut map = Map::new();
            for mut entry in list {
                if let Some(alarm) = entry.as_object_mut() {
                    for (old, new) in [
                        ("snooze_duration", "snooze_duration_min"),
                        ("auto_dismiss_timeout", "auto_dismiss_timeout_min"),
                        ("pre_alarm_duration", "pre_alarm_duration_min"),
                        ("script_timeout", "script_timeout_s"),
                    ] {
                        if let Some(value) = alarm.remove(old) {
                            alarm.entry(new).or_insert(value);
                        }
                    }
                }
                let Some(id) = entry.get("id").and_then(Value::as_str).map(str::to_string)
                else {
                    log::warn!("Dropping v1 alarm entry without an id during migration");
                    continue;
                };
                map.insert(id, entry);
            }
            obj.insert("alarms".to_string(), Value::Object(map));
        }
    }

    if let Some(obj) = raw.as_object_mut() {
        obj.insert("version".to_string(), Value::from(STORE_VERSION));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TestContext;
    use crate::model::AlarmState;

    fn store() -> (Arc<TestContext>, EngineStore) {
        let ctx = Arc::new(TestContext::new());
        let store = EngineStore::load(Arc::clone(&ctx) as Arc<dyn AppContext>);
        (ctx, store)
    }

    #[test]
    fn missing_file_loads_empty() {
        let (_ctx, store) = store();
        assert_eq!(store.alarm_count(), 0);
        assert_eq!(store.version(), STORE_VERSION);
    }

    #[test]
    fn add_save_reload_round_trip() {
        let (ctx, mut store) = store();
        store.add_alarm(Alarm::new("a1", "Morning", "07:00")).unwrap();

        let reloaded = EngineStore::load(Arc::clone(&ctx) as Arc<dyn AppContext>);
        assert_eq!(reloaded.alarm_count(), 1);
        assert_eq!(reloaded.get_alarm("a1").unwrap().time, "07:00");
    }

    #[test]
    fn remove_leaves_no_trace() {
        let (ctx, mut store) = store();
        store.add_alarm(Alarm::new("a1", "Morning", "07:00")).unwrap();
        let mut state = RuntimeState::default();
        state.state = AlarmState::Armed;
        store.save_runtime_state("a1", state).unwrap();

        assert!(store.remove_alarm("a1").unwrap());
        assert!(!store.remove_alarm("a1").unwrap());

        let reloaded = EngineStore::load(Arc::clone(&ctx) as Arc<dyn AppContext>);
        assert!(reloaded.get_alarm("a1").is_none());
        assert!(reloaded.get_runtime_state("a1").is_none());
        let path = ctx.get_store_path().unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert!(!content.contains("a1"));
    }

    #[test]
    fn corrupt_file_falls_back_to_empty() {
        let (ctx, _store) = store();
        let path = ctx.get_store_path().unwrap();
        fs::write(&path, "{ not json").unwrap();

        let store = EngineStore::load(Arc::clone(&ctx) as Arc<dyn AppContext>);
        assert_eq!(store.alarm_count(), 0);
    }

    #[test]
    fn newer_version_is_not_clobbered_silently() {
        let (ctx, _store) = store();
        let path = ctx.get_store_path().unwrap();
        fs::write(&path, r#"{"version": 99, "alarms": {}}"#).unwrap();

        // Treated like corruption: engine starts empty rather than guessing.
        let store = EngineStore::load(Arc::clone(&ctx) as Arc<dyn AppContext>);
        assert_eq!(store.alarm_count(), 0);
    }

    #[test]
    fn migrates_v1_list_layout() {
        let (ctx, _store) = store();
        let path = ctx.get_store_path().unwrap();
        let v1 = r#"{
            "version": 1,
            "alarms": [
                {
                    "id": "old1",
                    "name": "Legacy",
                    "time": "06:45",
                    "snooze_duration": 7,
                    "auto_dismiss_timeout": 45,
                    "script_timeout": 20
                }
            ]
        }"#;
        fs::write(&path, v1).unwrap();

        let store = EngineStore::load(Arc::clone(&ctx) as Arc<dyn AppContext>);
        let alarm = store.get_alarm("old1").expect("migrated alarm");
        assert_eq!(alarm.snooze_duration_min, 7);
        assert_eq!(alarm.auto_dismiss_timeout_min, 45);
        assert_eq!(alarm.script_timeout_s, 20);
        assert_eq!(store.version(), STORE_VERSION);
    }

    #[test]
    fn unknown_envelope_keys_survive_save() {
        let (ctx, _store) = store();
        let path = ctx.get_store_path().unwrap();
        fs::write(
            &path,
            r#"{"version": 2, "alarms": {}, "future_feature": {"x": 1}}"#,
        )
        .unwrap();

        let mut store = EngineStore::load(Arc::clone(&ctx) as Arc<dyn AppContext>);
        store.add_alarm(Alarm::new("a1", "Morning", "07:00")).unwrap();

        let content = fs::read_to_string(ctx.get_store_path().unwrap()).unwrap();
        assert!(content.contains("future_feature"));
    }

    #[test]
    fn serialized_alarm_round_trip_is_stable() {
        let mut alarm = Alarm::new("a1", "Morning", "07:00");
        alarm.script_on_dismiss = Some("coffee".to_string());
        alarm
            .extra
            .insert("later_field".to_string(), Value::from(42));

        let once = serde_json::to_string(&alarm).unwrap();
        let back: Alarm = serde_json::from_str(&once).unwrap();
        let twice = serde_json::to_string(&back).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn settings_round_trip() {
        let (ctx, mut store) = store();
        let mut settings = GlobalSettings::default();
        settings.missed_alarm_grace_period_min = 10;
        store.update_settings(settings).unwrap();

        let reloaded = EngineStore::load(Arc::clone(&ctx) as Arc<dyn AppContext>);
        assert_eq!(reloaded.settings().missed_alarm_grace_period_min, 10);
        assert_eq!(reloaded.settings().watchdog_timeout_s, 60);
    }
}
