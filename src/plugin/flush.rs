//! Scan Flush
//!
//! Turns the dirty state of a session cache into store mutations inside the
//! scan's transaction. Nothing in the cache is marked clean here; the
//! session applies the returned [`FlushOutcome`] only once the transaction
//! has committed, so a failed commit leaves every delta in place for the
//! next scan.

use crate::domain::ports::{ClassId, RecordId, StoreTransaction};
use crate::error::{Error, Result};
use crate::graph::ResourceHandle;
use crate::manager::PluginManager;
use crate::plugin::alerts::AlertKey;
use crate::plugin::cache::SessionCache;
use crate::plugin::events::ScanKind;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Store mutations made by one flush, to be applied after commit
#[derive(Debug, Default)]
pub(crate) struct FlushOutcome {
    /// Resources written, with the record they live in
    pub persisted: Vec<(ResourceHandle, RecordId)>,
    /// Records created by this flush, with their type name
    pub created: Vec<(RecordId, String)>,
    pub culled: BTreeSet<RecordId>,
    /// Alert transitions pushed to the store
    pub alerts_sent: Vec<(AlertKey, RecordId, bool)>,
    /// Alert transitions whose record no longer exists
    pub alerts_dropped: Vec<AlertKey>,
    /// Dirty resources left for a later flush
    pub skipped: usize,
}

/// Write every delta of `cache` through `tx`
pub(crate) fn flush(
    cache: &mut SessionCache,
    tx: &mut (dyn StoreTransaction + '_),
    manager: &PluginManager,
    kind: ScanKind,
) -> Result<FlushOutcome> {
    let mut outcome = FlushOutcome::default();
    let mut rids: HashMap<ResourceHandle, RecordId> = HashMap::new();
    for handle in cache.handles() {
        if let Some(record_id) = cache.get(handle)?.record_id() {
            rids.insert(handle, record_id);
        }
    }

    let mut skipped = Vec::new();
    let orphan_candidates =
        persist_dirty(cache, tx, manager, &mut rids, &mut outcome, &mut skipped)?;

    let mut visited = HashSet::new();
    for record_id in cache.pending_culls().clone() {
        if tx.record(record_id)?.is_some() {
            cull(tx, record_id, &mut visited, &mut outcome.culled)?;
        }
    }

    for (handle, record_id) in orphan_candidates {
        let is_root = cache.get(handle)?.is_root();
        if !is_root && !outcome.culled.contains(&record_id) && tx.parents_of(record_id)?.is_empty() {
            debug!(%handle, %record_id, "Resource lost its last parent");
            cull(tx, record_id, &mut visited, &mut outcome.culled)?;
        }
    }

    if kind == ScanKind::Initial {
        let mut unplaced = HashSet::new();
        for handle in skipped {
            let resource = cache.get(handle)?;
            let resource_type = resource.resource_type();
            let class_id =
                manager.get_resource_class_id(resource_type.module(), resource_type.name())?;
            unplaced.insert((class_id, resource.id_str()?));
        }
        reconcile(tx, &rids, &unplaced, &mut visited, &mut outcome.culled)?;
    }

    flush_alerts(cache, tx, &rids, &mut outcome)?;
    Ok(outcome)
}

/// Persist dirty resources, parents before children
///
/// A resource whose parents or scope have no record yet waits for the rest
/// of the pass and is retried; whatever still cannot be placed stays dirty
/// and is added to `skipped`. Returns the persisted resources that had
/// parents removed, for the orphan check.
fn persist_dirty(
    cache: &SessionCache,
    tx: &mut (dyn StoreTransaction + '_),
    manager: &PluginManager,
    rids: &mut HashMap<ResourceHandle, RecordId>,
    outcome: &mut FlushOutcome,
    skipped: &mut Vec<ResourceHandle>,
) -> Result<Vec<(ResourceHandle, RecordId)>> {
    let mut orphan_candidates = Vec::new();
    let mut pending = Vec::new();

    for handle in cache.handles() {
        let resource = cache.get(handle)?;
        if !resource.is_dirty() {
            continue;
        }
        if let Err(e) = resource.validate() {
            warn!(resource = %resource, error = %e, "Skipping invalid resource");
            skipped.push(handle);
            continue;
        }
        pending.push(handle);
    }

    while !pending.is_empty() {
        let mut waiting = Vec::new();
        for handle in &pending {
            match persist_one(cache, tx, manager, *handle, rids, outcome)? {
                Some(record_id) => {
                    if !cache.get(*handle)?.removed_parents().is_empty() {
                        orphan_candidates.push((*handle, record_id));
                    }
                    outcome.persisted.push((*handle, record_id));
                }
                None => waiting.push(*handle),
            }
        }
        if waiting.len() == pending.len() {
            break;
        }
        pending = waiting;
    }

    for handle in pending {
        warn!(resource = %cache.get(handle)?, "Skipping resource whose parents are not persisted");
        skipped.push(handle);
    }
    outcome.skipped = skipped.len();
    Ok(orphan_candidates)
}

/// Write one resource; `None` if a parent or its scope has no record yet
fn persist_one(
    cache: &SessionCache,
    tx: &mut (dyn StoreTransaction + '_),
    manager: &PluginManager,
    handle: ResourceHandle,
    rids: &mut HashMap<ResourceHandle, RecordId>,
    outcome: &mut FlushOutcome,
) -> Result<Option<RecordId>> {
    let resource = cache.get(handle)?;
    let parent_ids: Option<Vec<RecordId>> = resource
        .parents()
        .iter()
        .map(|p| rids.get(p).copied())
        .collect();
    let Some(parent_ids) = parent_ids else {
        return Ok(None);
    };

    let record_id = match resource.record_id() {
        Some(record_id) => {
            for name in resource.dirty_attributes() {
                match resource.get(name) {
                    Some(value) => tx.upsert_attribute(record_id, name, value)?,
                    None => tx.delete_attribute(record_id, name)?,
                }
            }
            if resource.parents_dirty() {
                for parent_id in &parent_ids {
                    tx.add_parent_edge(record_id, *parent_id)?;
                }
                for removed in resource.removed_parents() {
                    if let Some(parent_id) = rids.get(removed) {
                        tx.remove_parent_edge(record_id, *parent_id)?;
                    }
                }
            }
            record_id
        }
        None => {
            let scope_id = match cache.scope_of(handle) {
                Some(scope) => match rids.get(&scope) {
                    Some(scope_id) => Some(*scope_id),
                    None => return Ok(None),
                },
                None => None,
            };
            let resource_type = resource.resource_type();
            let class_id =
                manager.get_resource_class_id(resource_type.module(), resource_type.name())?;
            let id_str = resource.id_str()?;
            let (record_id, created) = tx.get_or_create_record(class_id, &id_str, scope_id)?;

            if created {
                outcome
                    .created
                    .push((record_id, resource_type.name().to_string()));
            } else {
                for stale in tx.attributes_of(record_id)?.keys() {
                    if resource.get(stale).is_none() {
                        tx.delete_attribute(record_id, stale)?;
                    }
                }
            }
            for (name, value) in resource.values() {
                tx.upsert_attribute(record_id, name, value)?;
            }
            for parent_id in &parent_ids {
                tx.add_parent_edge(record_id, *parent_id)?;
            }
            rids.insert(handle, record_id);
            record_id
        }
    };

    for (name, value) in resource.pending_statistics() {
        tx.update_statistic(record_id, name, value)?;
    }
    debug!(resource = %resource, %record_id, "Persisted resource");
    Ok(Some(record_id))
}

/// Delete a record and every descendant left without a parent
pub(crate) fn cull(
    tx: &mut (dyn StoreTransaction + '_),
    record_id: RecordId,
    visited: &mut HashSet<RecordId>,
    culled: &mut BTreeSet<RecordId>,
) -> Result<()> {
    if !visited.insert(record_id) {
        return Ok(());
    }
    for child in tx.children_of(record_id)? {
        tx.remove_parent_edge(child, record_id)?;
        if tx.parents_of(child)?.is_empty() {
            cull(tx, child, visited, culled)?;
        }
    }
    tx.delete_record(record_id)?;
    debug!(%record_id, "Culled record");
    culled.insert(record_id);
    Ok(())
}

/// Unlink persisted children of cached records that the scan did not report
///
/// Records matching a reported resource that could not be written this
/// time (`unplaced`, by class and identity) are left in place.
fn reconcile(
    tx: &mut (dyn StoreTransaction + '_),
    rids: &HashMap<ResourceHandle, RecordId>,
    unplaced: &HashSet<(ClassId, String)>,
    visited: &mut HashSet<RecordId>,
    culled: &mut BTreeSet<RecordId>,
) -> Result<()> {
    let cached: HashSet<RecordId> = rids.values().copied().collect();
    let mut parents: Vec<(ResourceHandle, RecordId)> = rids.iter().map(|(h, r)| (*h, *r)).collect();
    parents.sort();

    for (_, record_id) in parents {
        if culled.contains(&record_id) {
            continue;
        }
        for child in tx.children_of(record_id)? {
            if cached.contains(&child) || culled.contains(&child) {
                continue;
            }
            if let Some(record) = tx.record(child)? {
                if unplaced.contains(&(record.class_id, record.id_str)) {
                    continue;
                }
            }
            debug!(%record_id, %child, "Unlinking child missing from scan");
            tx.remove_parent_edge(child, record_id)?;
            if tx.parents_of(child)?.is_empty() {
                cull(tx, child, visited, culled)?;
            }
        }
    }
    Ok(())
}

/// Evaluate alert conditions and push transitions to the store
fn flush_alerts(
    cache: &mut SessionCache,
    tx: &mut (dyn StoreTransaction + '_),
    rids: &HashMap<ResourceHandle, RecordId>,
    outcome: &mut FlushOutcome,
) -> Result<()> {
    let mut evaluations = Vec::new();
    for handle in cache.handles() {
        let resource = cache.get(handle)?;
        for condition in resource.resource_type().alert_conditions() {
            for result in condition.test(resource.values()) {
                let key = AlertKey::new(handle, result.name, result.attribute.as_deref());
                evaluations.push((key, result.active));
            }
        }
    }
    for (key, active) in evaluations {
        cache.alerts_mut().notify(key, active);
    }

    for key in cache.alerts().dirty_keys() {
        let active = cache.alerts().state(&key).unwrap_or(false);
        let record_id = match rids.get(&key.resource) {
            Some(record_id) if !outcome.culled.contains(record_id) => *record_id,
            Some(_) => {
                outcome.alerts_dropped.push(key);
                continue;
            }
            None if cache.get(key.resource).is_ok() => continue,
            None => {
                outcome.alerts_dropped.push(key);
                continue;
            }
        };
        match tx.notify_alert(record_id, active, &key.condition, key.attribute.as_deref()) {
            Ok(()) => outcome.alerts_sent.push((key, record_id, active)),
            Err(Error::RecordNotFound(_)) => {
                debug!(%record_id, condition = %key.condition, "Dropping alert for missing record");
                outcome.alerts_dropped.push(key);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Apply a committed flush to the cache
pub(crate) fn apply(cache: &mut SessionCache, outcome: &FlushOutcome) {
    for (handle, record_id) in &outcome.persisted {
        cache.mark_persisted(*handle, *record_id);
    }
    cache.clear_pending_culls();
    for record_id in &outcome.culled {
        cache.evict_record(*record_id);
    }
    for (key, _, active) in &outcome.alerts_sent {
        cache.alerts_mut().mark_committed(key, *active);
    }
    for key in &outcome.alerts_dropped {
        cache.alerts_mut().forget(key);
    }
}
