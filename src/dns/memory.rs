use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{
    Error, Interface, Lookup, RecordSet, RecordSetListResult, RecordType, Result, Zone,
    ZoneListResult, ZoneProperties,
};

type ZoneKey = (String, String);
type RecordSetKey = (String, String, RecordType, String);

#[derive(Default)]
struct State {
    zones: BTreeMap<ZoneKey, Zone>,
    record_sets: BTreeMap<RecordSetKey, RecordSet>,
    failures: VecDeque<Error>,
}

impl State {
    fn injected_failure(&mut self) -> Result<()> {
        match self.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// An in-process DNS provider.
///
/// By default zones spring into existence when a record set is written to
/// them. Once a zone has been registered with [`MemoryClient::with_zone`],
/// only registered zones exist and record set operations against any other
/// zone fail the way the real service does.
pub struct MemoryClient {
    state: Mutex<State>,
    strict_zones: bool,
    page_size: usize,
}

impl Default for MemoryClient {
    fn default() -> Self {
        MemoryClient {
            state: Mutex::default(),
            strict_zones: false,
            page_size: 100,
        }
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zone(mut self, resource_group: &str, zone_name: &str) -> Self {
        let zone = Zone {
            name: zone_name.to_owned(),
            location: "global".to_owned(),
            ..Default::default()
        };
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .zones
            .insert(zone_key(resource_group, zone_name), zone);
        self.strict_zones = true;
        self
    }

    /// Limits list pages to `page_size` entries so callers have to follow
    /// continuation links.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Makes the next call, whichever operation it is, fail with `error`.
    /// Queued failures are returned in order.
    pub fn fail_next(&self, error: Error) {
        self.lock().failures.push_back(error);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn zone_exists(&self, state: &State, resource_group: &str, zone_name: &str) -> bool {
        !self.strict_zones || state.zones.contains_key(&zone_key(resource_group, zone_name))
    }

    fn page<T: Clone>(&self, items: Vec<T>, continuation: Option<&str>) -> Result<(Vec<T>, Option<String>)> {
        let offset = match continuation {
            Some(link) => link
                .strip_prefix("memory://next?skip=")
                .and_then(|skip| skip.parse::<usize>().ok())
                .ok_or_else(|| Error::Url(format!("invalid continuation link {link:?}")))?,
            None => 0,
        };

        let end = offset.saturating_add(self.page_size).min(items.len());
        let page = items.get(offset..end).map(<[T]>::to_vec).unwrap_or_default();
        let next_link = (end < items.len()).then(|| format!("memory://next?skip={end}"));
        Ok((page, next_link))
    }
}

fn zone_key(resource_group: &str, zone_name: &str) -> ZoneKey {
    (resource_group.to_owned(), zone_name.to_owned())
}

fn record_set_key(
    resource_group: &str,
    zone_name: &str,
    record_type: RecordType,
    relative_name: &str,
) -> RecordSetKey {
    (
        resource_group.to_owned(),
        zone_name.to_owned(),
        record_type,
        relative_name.to_owned(),
    )
}

fn parent_not_found(zone_name: &str) -> Error {
    Error::Api {
        status: StatusCode::NOT_FOUND,
        code: "ParentResourceNotFound".to_owned(),
        message: format!("Parent resource '{zone_name}' not found."),
        target: None,
    }
}

fn with_record_count(state: &State, (resource_group, zone_name): &ZoneKey, zone: &Zone) -> Zone {
    let count = state
        .record_sets
        .keys()
        .filter(|(rg, zone, _, _)| rg == resource_group && zone == zone_name)
        .count();

    let mut zone = zone.clone();
    let properties = zone.properties.get_or_insert_with(ZoneProperties::default);
    properties.number_of_record_sets = i64::try_from(count).ok();
    zone
}

#[async_trait]
impl Interface for MemoryClient {
    async fn create_or_update_zone(
        &self,
        resource_group: &str,
        zone_name: &str,
        zone: &Zone,
    ) -> Result<Zone> {
        let mut state = self.lock();
        state.injected_failure()?;
        let key = zone_key(resource_group, zone_name);
        let mut stored = zone.clone();
        stored.name = zone_name.to_owned();
        state.zones.insert(key.clone(), stored.clone());
        Ok(with_record_count(&state, &key, &stored))
    }

    async fn delete_zone(&self, resource_group: &str, zone_name: &str) -> Result<()> {
        let mut state = self.lock();
        state.injected_failure()?;
        state.zones.remove(&zone_key(resource_group, zone_name));
        state
            .record_sets
            .retain(|(rg, zone, _, _), _| !(rg == resource_group && zone == zone_name));
        Ok(())
    }

    async fn get_zone(&self, resource_group: &str, zone_name: &str) -> Result<Lookup<Zone>> {
        let mut state = self.lock();
        state.injected_failure()?;
        let key = zone_key(resource_group, zone_name);
        Ok(match state.zones.get(&key) {
            Some(zone) => Lookup::found(with_record_count(&state, &key, zone)),
            None => Lookup::missing(StatusCode::NO_CONTENT),
        })
    }

    async fn list_zones(
        &self,
        resource_group: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ZoneListResult> {
        let mut state = self.lock();
        state.injected_failure()?;
        let zones: Vec<Zone> = state
            .zones
            .iter()
            .filter(|((rg, _), _)| resource_group.map_or(true, |wanted| rg == wanted))
            .map(|(key, zone)| with_record_count(&state, key, zone))
            .collect();

        let (value, next_link) = self.page(zones, continuation)?;
        Ok(ZoneListResult { value, next_link })
    }

    async fn create_or_update_record_set(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: RecordType,
        relative_name: &str,
        record_set: &RecordSet,
    ) -> Result<RecordSet> {
        let mut state = self.lock();
        state.injected_failure()?;
        if !self.zone_exists(&state, resource_group, zone_name) {
            return Err(parent_not_found(zone_name));
        }
        state
            .zones
            .entry(zone_key(resource_group, zone_name))
            .or_insert_with(|| Zone {
                name: zone_name.to_owned(),
                location: "global".to_owned(),
                ..Default::default()
            });

        let mut stored = record_set.clone();
        stored.name = relative_name.to_owned();
        stored.type_ = record_type.as_str().to_owned();
        stored.properties.fqdn = Some(format!("{relative_name}.{zone_name}."));

        state.record_sets.insert(
            record_set_key(resource_group, zone_name, record_type, relative_name),
            stored.clone(),
        );
        Ok(stored)
    }

    async fn delete_record_set(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: RecordType,
        relative_name: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        state.injected_failure()?;
        if !self.zone_exists(&state, resource_group, zone_name) {
            return Err(Error::ZoneNotFound {
                resource_group: resource_group.to_owned(),
                zone: zone_name.to_owned(),
                record_type,
                name: relative_name.to_owned(),
            });
        }

        state.record_sets.remove(&record_set_key(
            resource_group,
            zone_name,
            record_type,
            relative_name,
        ));
        Ok(())
    }

    async fn get_record_set(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: RecordType,
        relative_name: &str,
    ) -> Result<Lookup<RecordSet>> {
        let mut state = self.lock();
        state.injected_failure()?;
        let key = record_set_key(resource_group, zone_name, record_type, relative_name);
        Ok(match state.record_sets.get(&key) {
            Some(record_set) => Lookup::found(record_set.clone()),
            None => Lookup::missing(StatusCode::NOT_FOUND),
        })
    }

    async fn list_record_sets(
        &self,
        resource_group: &str,
        zone_name: &str,
        record_type: Option<RecordType>,
        continuation: Option<&str>,
    ) -> Result<RecordSetListResult> {
        let mut state = self.lock();
        state.injected_failure()?;
        if !self.zone_exists(&state, resource_group, zone_name) {
            return Err(parent_not_found(zone_name));
        }

        let record_sets: Vec<RecordSet> = state
            .record_sets
            .iter()
            .filter(|((rg, zone, kind, _), _)| {
                rg == resource_group
                    && zone == zone_name
                    && record_type.map_or(true, |wanted| *kind == wanted)
            })
            .map(|(_, record_set)| record_set.clone())
            .collect();

        let (value, next_link) = self.page(record_sets, continuation)?;
        Ok(RecordSetListResult { value, next_link })
    }
}
