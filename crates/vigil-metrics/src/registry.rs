use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use vigil_common::{
    labels_to_text, points_to_family, Label, MetricAnnotations, MetricFamily, MetricPoint,
    PointPusher, RESERVED_LABEL_PREFIX,
};
use vigil_task::{Runner, Shutdown};

const PUSHED_POINTS_SWEEP_SECS: i64 = 300;
const GATHER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// What a gather request wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryType {
    /// Regular sources only; probes are skipped. The default, so a plain
    /// scrape never triggers active probing.
    #[default]
    NoProbe,
    OnlyProbes,
    All,
}

/// Extra information forwarded to gatherers that care.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatherState {
    pub query_type: QueryType,
    /// Ask tick-driven gatherers to collect immediately.
    pub no_tick: bool,
}

impl GatherState {
    /// Derive a state from HTTP query parameters: `includeMonitors` selects
    /// everything, `onlyMonitors` restricts to probes.
    pub fn from_query(params: &HashMap<String, String>) -> GatherState {
        let mut state = GatherState::default();
        if params.contains_key("includeMonitors") {
            state.query_type = QueryType::All;
        }
        if params.contains_key("onlyMonitors") {
            state.query_type = QueryType::OnlyProbes;
        }
        state
    }
}

/// A source of metric families.
#[async_trait]
pub trait Gatherer: Send + Sync {
    async fn gather(&self, state: GatherState) -> Result<Vec<MetricFamily>>;
}

/// A fixed slice of families; useful for tests and one-shot sources.
pub struct SliceGatherer(pub Vec<MetricFamily>);

#[async_trait]
impl Gatherer for SliceGatherer {
    async fn gather(&self, _state: GatherState) -> Result<Vec<MetricFamily>> {
        Ok(self.0.clone())
    }
}

/// Probe gatherers are active checks: they only run when asked for
/// (`OnlyProbes`/`All`), never on a plain scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GathererKind {
    #[default]
    Normal,
    Probe,
}

struct Registered {
    id: u32,
    gatherer: Arc<dyn Gatherer>,
    /// Sorted by name, reserved names already removed.
    extra_labels: Vec<Label>,
    annotations: MetricAnnotations,
    kind: GathererKind,
}

struct PushedPoint {
    point: MetricPoint,
    expires_at: DateTime<Utc>,
}

struct Inner {
    gatherers: Vec<Arc<Registered>>,
    next_id: u32,
    pushed: HashMap<String, PushedPoint>,
    last_sweep: DateTime<Utc>,
    delay: Duration,
}

/// The metric registry. Shared behind an [`Arc`]; the collection loop runs
/// through its [`Runner`] implementation.
pub struct Registry {
    inner: Mutex<Inner>,
    /// Sink receiving points from the aligned collection loop and,
    /// synchronously, every pushed point.
    pusher: Mutex<Option<Arc<dyn PointPusher>>>,
    delay_tx: watch::Sender<Duration>,
}

impl Registry {
    pub fn new() -> Registry {
        let (delay_tx, _) = watch::channel(DEFAULT_DELAY);
        Registry {
            inner: Mutex::new(Inner {
                gatherers: Vec::new(),
                next_id: 1,
                pushed: HashMap::new(),
                last_sweep: Utc::now(),
                delay: DEFAULT_DELAY,
            }),
            pusher: Mutex::new(None),
            delay_tx,
        }
    }

    /// Configure the scheduled point sink. Pushed points are forwarded to
    /// it synchronously; the collection loop sends its gathers there too.
    pub fn set_pusher(&self, pusher: Arc<dyn PointPusher>) {
        *self.pusher.lock().unwrap() = Some(pusher);
    }

    /// Register a gatherer and return its id. `extra_labels` are merged
    /// into every returned sample, the gatherer value winning on conflict;
    /// reserved (`__`-prefixed) names are never exposed.
    pub fn register_gatherer(
        &self,
        gatherer: Arc<dyn Gatherer>,
        mut extra_labels: Vec<Label>,
        annotations: MetricAnnotations,
        kind: GathererKind,
    ) -> u32 {
        extra_labels.retain(|l| !l.name.starts_with(RESERVED_LABEL_PREFIX));
        extra_labels.sort_by(|a, b| a.name.cmp(&b.name));

        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.gatherers.push(Arc::new(Registered {
            id,
            gatherer,
            extra_labels,
            annotations,
            kind,
        }));
        id
    }

    /// Remove a gatherer. Returns whether it was present.
    pub fn unregister(&self, id: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.gatherers.len();
        inner.gatherers.retain(|g| g.id != id);
        inner.gatherers.len() < before
    }

    /// Store pushed points with a time-to-live and forward them to the
    /// configured sink. Expired entries are swept lazily, at most every
    /// five minutes.
    pub fn push_points_ttl(&self, points: Vec<MetricPoint>, ttl: Duration) {
        let now = Utc::now();
        let expires_at = now + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero());
        {
            let mut inner = self.inner.lock().unwrap();
            for point in &points {
                let key = labels_to_text(&point.labels);
                inner.pushed.insert(
                    key,
                    PushedPoint {
                        point: point.clone(),
                        expires_at,
                    },
                );
            }
            if now - inner.last_sweep > ChronoDuration::seconds(PUSHED_POINTS_SWEEP_SECS) {
                inner.last_sweep = now;
                inner.pushed.retain(|_, p| p.expires_at > now);
            }
        }

        let pusher = self.pusher.lock().unwrap().clone();
        if let Some(pusher) = pusher {
            pusher.push_points(points);
        }
    }

    /// A [`PointPusher`] pushing into this registry with a fixed TTL.
    pub fn with_ttl(self: &Arc<Self>, ttl: Duration) -> Arc<dyn PointPusher> {
        Arc::new(TtlPusher {
            registry: Arc::clone(self),
            ttl,
        })
    }

    /// Atomically change the collection interval; the running loop restarts
    /// with the new alignment.
    pub fn update_delay(&self, delay: Duration) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.delay == delay {
                return;
            }
            inner.delay = delay;
        }
        tracing::debug!(?delay, "metric collection delay updated");
        let _ = self.delay_tx.send(delay);
    }

    pub fn current_delay(&self) -> Duration {
        self.inner.lock().unwrap().delay
    }

    /// Gather every eligible source in parallel and merge the returned
    /// families by name. The first help text seen wins; families whose kind
    /// disagrees with the first occurrence are dropped.
    pub async fn gather_with_state(&self, state: GatherState) -> Vec<MetricFamily> {
        let gatherers: Vec<Arc<Registered>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .gatherers
                .iter()
                .filter(|g| match state.query_type {
                    QueryType::All => true,
                    QueryType::NoProbe => g.kind == GathererKind::Normal,
                    QueryType::OnlyProbes => g.kind == GathererKind::Probe,
                })
                .cloned()
                .collect()
        };

        let mut set = JoinSet::new();
        for registered in gatherers {
            set.spawn(async move {
                let result =
                    tokio::time::timeout(GATHER_TIMEOUT, registered.gatherer.gather(state)).await;
                let families = match result {
                    Ok(Ok(families)) => families,
                    Ok(Err(err)) => {
                        tracing::warn!(gatherer = registered.id, error = %err, "gather failed");
                        Vec::new()
                    }
                    Err(_) => {
                        tracing::warn!(gatherer = registered.id, "gather timed out");
                        Vec::new()
                    }
                };
                apply_extra_labels(families, &registered.extra_labels)
            });
        }

        let mut all_families = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(families) = joined {
                all_families.extend(families);
            }
        }

        if state.query_type != QueryType::OnlyProbes {
            if let Some(family_list) = self.gather_pushed(Utc::now()) {
                all_families.extend(family_list);
            }
        }

        merge_families(all_families)
    }

    /// Pushed points as untyped families, sweeping expired entries.
    fn gather_pushed(&self, now: DateTime<Utc>) -> Option<Vec<MetricFamily>> {
        let mut inner = self.inner.lock().unwrap();
        inner.last_sweep = now;
        inner.pushed.retain(|_, p| p.expires_at > now);

        let mut by_name: HashMap<&str, Vec<&MetricPoint>> = HashMap::new();
        for pushed in inner.pushed.values() {
            by_name
                .entry(pushed.point.name())
                .or_default()
                .push(&pushed.point);
        }
        if by_name.is_empty() {
            return None;
        }
        Some(
            by_name
                .into_iter()
                .map(|(name, points)| points_to_family(name, &points))
                .collect(),
        )
    }

    /// Gather annotated points for the collection loop.
    async fn gather_points(&self, state: GatherState) -> Vec<MetricPoint> {
        let now = Utc::now();
        let gatherers: Vec<Arc<Registered>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .gatherers
                .iter()
                .filter(|g| g.kind == GathererKind::Normal)
                .cloned()
                .collect()
        };

        let mut set = JoinSet::new();
        for registered in gatherers {
            set.spawn(async move {
                let result =
                    tokio::time::timeout(GATHER_TIMEOUT, registered.gatherer.gather(state)).await;
                let families = match result {
                    Ok(Ok(families)) => families,
                    Ok(Err(err)) => {
                        tracing::warn!(gatherer = registered.id, error = %err, "gather failed");
                        Vec::new()
                    }
                    Err(_) => {
                        tracing::warn!(gatherer = registered.id, "gather timed out");
                        Vec::new()
                    }
                };
                let families = apply_extra_labels(families, &registered.extra_labels);
                let mut points: Vec<MetricPoint> = families
                    .iter()
                    .flat_map(|f| f.to_points(now))
                    .collect();
                if registered.annotations != MetricAnnotations::default() {
                    for point in &mut points {
                        point.annotations = registered.annotations.clone();
                    }
                }
                points
            });
        }

        let mut all_points = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(points) = joined {
                all_points.extend(points);
            }
        }
        all_points
    }

    async fn run_with_delay(&self, shutdown: &Shutdown, delay: Duration) -> LoopExit {
        let mut delay_rx = self.delay_tx.subscribe();
        // First tick lands on a wall-clock multiple of the interval.
        let wait = duration_until_aligned(Utc::now(), delay);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.wait() => return LoopExit::Shutdown,
            _ = delay_rx.changed() => return LoopExit::DelayChanged,
        }

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + delay, delay);
        loop {
            let points = self.gather_points(GatherState::default()).await;
            let pusher = self.pusher.lock().unwrap().clone();
            if let Some(pusher) = pusher {
                pusher.push_points(points);
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => return LoopExit::Shutdown,
                _ = delay_rx.changed() => return LoopExit::DelayChanged,
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

enum LoopExit {
    Shutdown,
    DelayChanged,
}

#[async_trait]
impl Runner for Registry {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        loop {
            let delay = self.current_delay();
            match self.run_with_delay(&shutdown, delay).await {
                LoopExit::Shutdown => return Ok(()),
                LoopExit::DelayChanged => continue,
            }
        }
    }
}

/// Pusher adapter storing points in the registry with a fixed TTL.
pub struct TtlPusher {
    registry: Arc<Registry>,
    ttl: Duration,
}

impl PointPusher for TtlPusher {
    fn push_points(&self, points: Vec<MetricPoint>) {
        self.registry.push_points_ttl(points, self.ttl);
    }
}

/// Time until the next wall-clock multiple of `interval`.
pub fn duration_until_aligned(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_ms = interval.as_millis() as i64;
    if interval_ms == 0 {
        return Duration::ZERO;
    }
    let now_ms = now.timestamp_millis();
    let rem = now_ms.rem_euclid(interval_ms);
    if rem == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis((interval_ms - rem) as u64)
}

/// Merge `extra` (sorted) into each sample's sorted label list; the extra
/// value wins on name conflict.
fn apply_extra_labels(mut families: Vec<MetricFamily>, extra: &[Label]) -> Vec<MetricFamily> {
    if extra.is_empty() {
        return families;
    }
    for family in &mut families {
        for sample in &mut family.samples {
            sample.labels = merge_labels(&sample.labels, extra);
        }
    }
    families
}

/// Merge two sorted label lists; values from `b` win.
fn merge_labels(a: &[Label], b: &[Label]) -> Vec<Label> {
    let mut result = Vec::with_capacity(a.len() + b.len());
    let mut a_index = 0;
    for b_label in b {
        while a_index < a.len() && a[a_index].name < b_label.name {
            result.push(a[a_index].clone());
            a_index += 1;
        }
        if a_index < a.len() && a[a_index].name == b_label.name {
            a_index += 1;
        }
        result.push(b_label.clone());
    }
    while a_index < a.len() {
        result.push(a[a_index].clone());
        a_index += 1;
    }
    result
}

/// Merge families by name. The first help text wins; a family whose kind
/// disagrees with the first occurrence is dropped with an error.
fn merge_families(families: Vec<MetricFamily>) -> Vec<MetricFamily> {
    let mut by_name: HashMap<String, MetricFamily> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for family in families {
        match by_name.get_mut(&family.name) {
            Some(existing) => {
                if existing.kind != family.kind {
                    tracing::error!(
                        family = %family.name,
                        "gathered metric family has conflicting types, dropping"
                    );
                    continue;
                }
                existing.samples.extend(family.samples);
            }
            None => {
                order.push(family.name.clone());
                by_name.insert(family.name.clone(), family);
            }
        }
    }
    let mut result: Vec<MetricFamily> = order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect();
    result.sort_by(|a, b| a.name.cmp(&b.name));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vigil_common::{MetricKind, Sample};

    fn family(name: &str, help: &str, kind: MetricKind, value: f64) -> MetricFamily {
        MetricFamily {
            name: name.to_string(),
            help: help.to_string(),
            kind,
            samples: vec![Sample {
                labels: Vec::new(),
                value,
                timestamp: None,
            }],
        }
    }

    #[test]
    fn alignment_to_wall_clock() {
        let now = Utc.timestamp_millis_opt(1_700_000_003_500).unwrap();
        let wait = duration_until_aligned(now, Duration::from_secs(10));
        assert_eq!(wait, Duration::from_millis(6_500));

        let aligned = Utc.timestamp_millis_opt(1_700_000_010_000).unwrap();
        assert_eq!(
            duration_until_aligned(aligned, Duration::from_secs(10)),
            Duration::ZERO
        );
    }

    #[test]
    fn merge_labels_value_from_extra_wins() {
        let sample = vec![
            Label::new("instance", "scraped"),
            Label::new("job", "redis"),
        ];
        let extra = vec![
            Label::new("instance", "container"),
            Label::new("item", "redis-cache"),
        ];
        let merged = merge_labels(&sample, &extra);
        assert_eq!(
            merged,
            vec![
                Label::new("instance", "container"),
                Label::new("item", "redis-cache"),
                Label::new("job", "redis"),
            ]
        );
    }

    #[test]
    fn merge_families_first_help_wins_and_kind_conflict_drops() {
        let merged = merge_families(vec![
            family("up", "first help", MetricKind::Gauge, 1.0),
            family("up", "second help", MetricKind::Gauge, 0.0),
            family("up", "", MetricKind::Counter, 5.0),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].help, "first help");
        assert_eq!(merged[0].samples.len(), 2);
    }

    #[test]
    fn gather_state_from_query_params() {
        let mut params = HashMap::new();
        assert_eq!(
            GatherState::from_query(&params).query_type,
            QueryType::NoProbe
        );
        params.insert("includeMonitors".to_string(), "1".to_string());
        assert_eq!(GatherState::from_query(&params).query_type, QueryType::All);
        params.clear();
        params.insert("onlyMonitors".to_string(), String::new());
        assert_eq!(
            GatherState::from_query(&params).query_type,
            QueryType::OnlyProbes
        );
    }

    #[tokio::test]
    async fn probes_are_filtered_by_query_type() {
        let registry = Arc::new(Registry::new());
        registry.register_gatherer(
            Arc::new(SliceGatherer(vec![family(
                "node_metric",
                "",
                MetricKind::Gauge,
                1.0,
            )])),
            Vec::new(),
            MetricAnnotations::default(),
            GathererKind::Normal,
        );
        registry.register_gatherer(
            Arc::new(SliceGatherer(vec![family(
                "probe_metric",
                "",
                MetricKind::Gauge,
                1.0,
            )])),
            Vec::new(),
            MetricAnnotations::default(),
            GathererKind::Probe,
        );

        let default = registry.gather_with_state(GatherState::default()).await;
        assert!(default.iter().any(|f| f.name == "node_metric"));
        assert!(!default.iter().any(|f| f.name == "probe_metric"));

        let only = registry
            .gather_with_state(GatherState {
                query_type: QueryType::OnlyProbes,
                no_tick: false,
            })
            .await;
        assert!(only.iter().any(|f| f.name == "probe_metric"));
        assert!(!only.iter().any(|f| f.name == "node_metric"));

        let all = registry
            .gather_with_state(GatherState {
                query_type: QueryType::All,
                no_tick: false,
            })
            .await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn unregister_removes_gatherer() {
        let registry = Arc::new(Registry::new());
        let id = registry.register_gatherer(
            Arc::new(SliceGatherer(vec![family("m", "", MetricKind::Gauge, 1.0)])),
            Vec::new(),
            MetricAnnotations::default(),
            GathererKind::Normal,
        );
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        let families = registry.gather_with_state(GatherState::default()).await;
        assert!(families.is_empty());
    }

    #[tokio::test]
    async fn pushed_points_expire_with_ttl() {
        let registry = Arc::new(Registry::new());
        let point = MetricPoint::new("pushed_metric", Utc::now(), 4.0);
        registry.push_points_ttl(vec![point], Duration::from_millis(50));

        let families = registry.gather_with_state(GatherState::default()).await;
        assert!(families.iter().any(|f| f.name == "pushed_metric"));

        tokio::time::sleep(Duration::from_millis(110)).await;
        let families = registry.gather_with_state(GatherState::default()).await;
        assert!(!families.iter().any(|f| f.name == "pushed_metric"));
    }

    #[tokio::test]
    async fn pushed_points_forward_to_sink() {
        use std::sync::Mutex as StdMutex;

        #[derive(Default)]
        struct Sink(StdMutex<Vec<MetricPoint>>);
        impl PointPusher for Sink {
            fn push_points(&self, points: Vec<MetricPoint>) {
                self.0.lock().unwrap().extend(points);
            }
        }

        let registry = Arc::new(Registry::new());
        let sink = Arc::new(Sink::default());
        registry.set_pusher(sink.clone());

        let pusher = registry.with_ttl(Duration::from_secs(300));
        pusher.push_points(vec![MetricPoint::new("x", Utc::now(), 1.0)]);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn extra_labels_are_applied_and_reserved_dropped() {
        let registry = Arc::new(Registry::new());
        registry.register_gatherer(
            Arc::new(SliceGatherer(vec![family("m", "", MetricKind::Gauge, 1.0)])),
            vec![
                Label::new("item", "svc"),
                Label::new("__secret", "hidden"),
            ],
            MetricAnnotations::default(),
            GathererKind::Normal,
        );
        let families = registry.gather_with_state(GatherState::default()).await;
        let labels = &families[0].samples[0].labels;
        assert_eq!(labels, &vec![Label::new("item", "svc")]);
    }
}
