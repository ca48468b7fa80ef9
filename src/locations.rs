use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::Error;
use crate::http::ApiClient;

/// The seven dependent location levels, in cascade order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Country,
    Department,
    Municipality,
    Site,
    Block,
    Space,
    Warehouse,
}

impl Level {
    pub const ALL: [Level; 7] = [
        Level::Country,
        Level::Department,
        Level::Municipality,
        Level::Site,
        Level::Block,
        Level::Space,
        Level::Warehouse,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|l| *l == self).unwrap_or(0)
    }

    /// The immediate child level, None at the bottom of the hierarchy
    pub fn next(self) -> Option<Level> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

/// One selectable entry at a given level
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocationOption {
    pub id: i64,
    pub name: String,
}

/// The resolved selection, one optional id per level.
///
/// Invariant: a null level implies all deeper levels are null. The resolver
/// enforces this on every mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocationSelection {
    pub country_id: Option<i64>,
    pub department_id: Option<i64>,
    pub municipality_id: Option<i64>,
    pub site_id: Option<i64>,
    pub block_id: Option<i64>,
    pub space_id: Option<i64>,
    pub warehouse_id: Option<i64>,
}

impl LocationSelection {
    pub fn get(&self, level: Level) -> Option<i64> {
        match level {
            Level::Country => self.country_id,
            Level::Department => self.department_id,
            Level::Municipality => self.municipality_id,
            Level::Site => self.site_id,
            Level::Block => self.block_id,
            Level::Space => self.space_id,
            Level::Warehouse => self.warehouse_id,
        }
    }

    fn set(&mut self, level: Level, id: Option<i64>) {
        match level {
            Level::Country => self.country_id = id,
            Level::Department => self.department_id = id,
            Level::Municipality => self.municipality_id = id,
            Level::Site => self.site_id = id,
            Level::Block => self.block_id = id,
            Level::Space => self.space_id = id,
            Level::Warehouse => self.warehouse_id = id,
        }
    }
}

/// Where a level's options come from. The HTTP source is the real one; tests
/// script their own.
#[async_trait]
pub trait LocationSource {
    /// Options for `level`, scoped by the selected parent id where the level
    /// has a parent
    async fn options(&self, level: Level, parent_id: Option<i64>)
        -> Result<Vec<LocationOption>, Error>;
}

/// Wire row for the location endpoints. The unscoped site/block/space/
/// warehouse lists carry the parent foreign key used for client-side
/// filtering.
#[derive(Deserialize)]
struct LocationRow {
    id: i64,
    #[serde(default, alias = "nombre")]
    name: String,
    #[serde(default, rename = "municipioId")]
    municipio_id: Option<i64>,
    #[serde(default, rename = "sedeId")]
    sede_id: Option<i64>,
    #[serde(default, rename = "bloqueId")]
    bloque_id: Option<i64>,
    #[serde(default, rename = "espacioId")]
    espacio_id: Option<i64>,
}

const PAIS_PATH: &str = "/api/v1/items/pais/0";
const DEPARTAMENTO_PATH: &str = "/api/v1/items/departamento";
const MUNICIPIO_PATH: &str = "/api/v1/items/municipio";
const SEDE_PATH: &str = "/api/v1/sede";
const BLOQUE_PATH: &str = "/api/v1/bloque";
const ESPACIO_PATH: &str = "/api/v1/espacio";
const ALMACEN_PATH: &str = "/api/v1/almacen";

/// Location options from the backend REST API.
///
/// Country, department, and municipality have parent-scoped endpoints; the
/// remaining levels only exist as unscoped lists and are filtered here by the
/// parent foreign key.
pub struct HttpLocationSource {
    api: ApiClient,
}

impl HttpLocationSource {
    pub fn new(api: ApiClient) -> Self {
        HttpLocationSource { api }
    }

    async fn scoped(&self, base: &str, parent_id: Option<i64>) -> Result<Vec<LocationOption>, Error> {
        let parent = parent_id.ok_or_else(|| {
            Error::Validation(format!("{base} requires a parent selection"))
        })?;
        let rows: Vec<LocationRow> = self.api.get_list(&format!("{base}/{parent}")).await?;
        Ok(rows.into_iter().map(to_option).collect())
    }

    async fn filtered(
        &self,
        path: &str,
        parent_id: Option<i64>,
        key: fn(&LocationRow) -> Option<i64>,
    ) -> Result<Vec<LocationOption>, Error> {
        let rows: Vec<LocationRow> = self.api.get_list(path).await?;
        Ok(rows
            .into_iter()
            .filter(|row| key(row) == parent_id && parent_id.is_some())
            .map(to_option)
            .collect())
    }
}

fn to_option(row: LocationRow) -> LocationOption {
    LocationOption {
        id: row.id,
        name: row.name,
    }
}

#[async_trait]
impl LocationSource for HttpLocationSource {
    async fn options(
        &self,
        level: Level,
        parent_id: Option<i64>,
    ) -> Result<Vec<LocationOption>, Error> {
        match level {
            Level::Country => {
                let rows: Vec<LocationRow> = self.api.get_list(PAIS_PATH).await?;
                Ok(rows.into_iter().map(to_option).collect())
            }
            Level::Department => self.scoped(DEPARTAMENTO_PATH, parent_id).await,
            Level::Municipality => self.scoped(MUNICIPIO_PATH, parent_id).await,
            Level::Site => self.filtered(SEDE_PATH, parent_id, |r| r.municipio_id).await,
            Level::Block => self.filtered(BLOQUE_PATH, parent_id, |r| r.sede_id).await,
            Level::Space => self.filtered(ESPACIO_PATH, parent_id, |r| r.bloque_id).await,
            Level::Warehouse => self.filtered(ALMACEN_PATH, parent_id, |r| r.espacio_id).await,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct LevelState {
    options: Vec<LocationOption>,
    loading: bool,
}

/// Iterative state machine over the ordered level list.
///
/// A change at level *n* nulls every deeper selection and option set, then
/// walks the cascade: fetch the child's options scoped by the new id, and
/// keep descending for as long as exactly one option comes back. Zero or
/// many options stop the walk, leaving the choice to the user.
///
/// Every cascade is tagged with a generation; a cascade that finds itself
/// superseded when its fetch resolves abandons its writes, so the last
/// request wins even when an earlier fetch is slower.
pub struct LocationResolver<S> {
    source: S,
    selection: LocationSelection,
    levels: [LevelState; 7],
    generation: Arc<AtomicU64>,
}

impl<S: LocationSource> LocationResolver<S> {
    pub fn new(source: S) -> Self {
        LocationResolver {
            source,
            selection: LocationSelection::default(),
            levels: Default::default(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn selection(&self) -> LocationSelection {
        self.selection
    }

    pub fn options(&self, level: Level) -> &[LocationOption] {
        &self.levels[level.index()].options
    }

    pub fn is_loading(&self, level: Level) -> bool {
        self.levels[level.index()].loading
    }

    /// Loads the country list. Auto-selection applies here too: a
    /// single-country tenant never sees the country picker.
    pub async fn load_initial(&mut self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.levels[Level::Country.index()].loading = true;
        let options = self.fetch(Level::Country, None).await;
        if self.is_stale(generation) {
            debug!("Discarding stale country fetch");
            return;
        }
        let state = &mut self.levels[Level::Country.index()];
        state.loading = false;
        state.options = options;
        if state.options.len() == 1 {
            let only = state.options[0].id;
            self.cascade_from(Level::Country, Some(only), generation).await;
        }
    }

    /// Applies a user (or auto) selection at `level` and runs the cascade
    pub async fn on_level_change(&mut self, level: Level, new_id: Option<i64>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.cascade_from(level, new_id, generation).await;
    }

    /// Clears all selections and option sets in one step
    pub fn reset(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.selection = LocationSelection::default();
        self.levels = Default::default();
    }

    async fn cascade_from(&mut self, level: Level, new_id: Option<i64>, generation: u64) {
        self.selection.set(level, new_id);
        self.clear_below(level);

        let mut current = level;
        let mut current_id = new_id;
        while let (Some(id), Some(child)) = (current_id, current.next()) {
            self.levels[child.index()].loading = true;
            let options = self.fetch(child, Some(id)).await;
            if self.is_stale(generation) {
                debug!("Discarding stale {:?} fetch", child);
                return;
            }
            let state = &mut self.levels[child.index()];
            state.loading = false;
            state.options = options;

            // unambiguous data collapses the picker; anything else stops here
            if state.options.len() == 1 {
                let only = state.options[0].id;
                debug!("Auto-selecting {:?} = {}", child, only);
                self.selection.set(child, Some(only));
                current = child;
                current_id = Some(only);
            } else {
                break;
            }
        }
    }

    /// A failed fetch is an empty option list, indistinguishable downstream
    /// from legitimately zero options
    async fn fetch(&self, level: Level, parent_id: Option<i64>) -> Vec<LocationOption> {
        match self.source.options(level, parent_id).await {
            Ok(options) => options,
            Err(err) => {
                warn!("Could not load {:?} options: {}", level, err);
                Vec::new()
            }
        }
    }

    fn clear_below(&mut self, level: Level) {
        for deeper in Level::ALL.iter().skip(level.index() + 1) {
            self.selection.set(*deeper, None);
            self.levels[deeper.index()] = LevelState::default();
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn opt(id: i64, name: &str) -> LocationOption {
        LocationOption {
            id,
            name: name.to_string(),
        }
    }

    /// Scripted source: fixed responses per level, call log, and an optional
    /// generation bump to simulate a newer request landing mid-fetch
    struct ScriptedSource {
        responses: HashMap<Level, Vec<LocationOption>>,
        failing: Vec<Level>,
        calls: Mutex<Vec<Level>>,
        supersede_on: Option<(Level, Arc<AtomicU64>)>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<(Level, Vec<LocationOption>)>) -> Self {
            ScriptedSource {
                responses: responses.into_iter().collect(),
                failing: Vec::new(),
                calls: Mutex::new(Vec::new()),
                supersede_on: None,
            }
        }
    }

    #[async_trait]
    impl LocationSource for ScriptedSource {
        async fn options(
            &self,
            level: Level,
            _parent_id: Option<i64>,
        ) -> Result<Vec<LocationOption>, Error> {
            self.calls.lock().unwrap().push(level);
            if let Some((at, generation)) = &self.supersede_on {
                if *at == level {
                    generation.fetch_add(1, Ordering::SeqCst);
                }
            }
            if self.failing.contains(&level) {
                return Err(Error::Storage(std::io::Error::other("backend down")));
            }
            Ok(self.responses.get(&level).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn single_option_cascades_until_ambiguity() {
        // one department under the country, three municipalities under it
        let source = ScriptedSource::new(vec![
            (Level::Department, vec![opt(10, "Antioquia")]),
            (
                Level::Municipality,
                vec![opt(20, "Medellin"), opt(21, "Bello"), opt(22, "Envigado")],
            ),
        ]);
        let mut resolver = LocationResolver::new(source);

        resolver.on_level_change(Level::Country, Some(1)).await;

        let sel = resolver.selection();
        assert_eq!(sel.country_id, Some(1));
        assert_eq!(sel.department_id, Some(10));
        assert_eq!(sel.municipality_id, None);
        assert_eq!(resolver.options(Level::Municipality).len(), 3);
        // cascade stopped, nothing deeper was fetched
        assert_eq!(resolver.options(Level::Site).len(), 0);
    }

    #[tokio::test]
    async fn parent_change_clears_every_deeper_level() {
        let source = ScriptedSource::new(vec![
            (Level::Department, vec![opt(10, "Uno")]),
            (Level::Municipality, vec![opt(20, "Solo")]),
            (Level::Site, vec![opt(30, "Sede A"), opt(31, "Sede B")]),
        ]);
        let mut resolver = LocationResolver::new(source);
        resolver.on_level_change(Level::Country, Some(1)).await;
        assert_eq!(resolver.selection().municipality_id, Some(20));

        resolver.on_level_change(Level::Country, None).await;

        let sel = resolver.selection();
        for level in Level::ALL.iter().skip(1) {
            assert_eq!(sel.get(*level), None, "level {level:?} should be null");
            assert!(resolver.options(*level).is_empty());
        }
    }

    #[tokio::test]
    async fn null_selection_issues_no_fetch() {
        let source = ScriptedSource::new(vec![]);
        let mut resolver = LocationResolver::new(source);
        resolver.on_level_change(Level::Municipality, None).await;
        assert!(resolver.source.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_becomes_empty_options() {
        let mut source = ScriptedSource::new(vec![]);
        source.failing.push(Level::Department);
        let mut resolver = LocationResolver::new(source);

        resolver.on_level_change(Level::Country, Some(1)).await;

        assert_eq!(resolver.selection().country_id, Some(1));
        assert!(resolver.options(Level::Department).is_empty());
        assert_eq!(resolver.selection().department_id, None);
        assert!(!resolver.is_loading(Level::Department));
    }

    #[tokio::test]
    async fn zero_options_stop_the_cascade() {
        let source = ScriptedSource::new(vec![(Level::Department, vec![])]);
        let mut resolver = LocationResolver::new(source);
        resolver.on_level_change(Level::Country, Some(1)).await;
        let calls = resolver.source.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![Level::Department]);
    }

    #[tokio::test]
    async fn superseded_cascade_discards_its_fetch() {
        let mut source = ScriptedSource::new(vec![(Level::Department, vec![opt(10, "Ghost")])]);
        let mut resolver = LocationResolver::new(ScriptedSource::new(vec![]));
        // the scripted source bumps the resolver generation mid-fetch,
        // standing in for a newer user action racing this cascade
        source.supersede_on = Some((Level::Department, resolver.generation.clone()));
        resolver.source = source;

        resolver.on_level_change(Level::Country, Some(1)).await;

        assert!(resolver.options(Level::Department).is_empty());
        assert_eq!(resolver.selection().department_id, None);
    }

    #[tokio::test]
    async fn single_country_is_auto_selected_on_initial_load() {
        let source = ScriptedSource::new(vec![
            (Level::Country, vec![opt(1, "Colombia")]),
            (Level::Department, vec![opt(10, "Cundinamarca"), opt(11, "Valle")]),
        ]);
        let mut resolver = LocationResolver::new(source);

        resolver.load_initial().await;

        assert_eq!(resolver.selection().country_id, Some(1));
        assert_eq!(resolver.options(Level::Department).len(), 2);
        assert_eq!(resolver.selection().department_id, None);
    }

    #[tokio::test]
    async fn reset_clears_everything_at_once() {
        let source = ScriptedSource::new(vec![(Level::Department, vec![opt(10, "Uno")])]);
        let mut resolver = LocationResolver::new(source);
        resolver.on_level_change(Level::Country, Some(1)).await;

        resolver.reset();

        assert_eq!(resolver.selection(), LocationSelection::default());
        for level in Level::ALL {
            assert!(resolver.options(level).is_empty());
        }
    }
}
