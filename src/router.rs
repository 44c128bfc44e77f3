//! Conditional multi-destination routing.
//!
//! Each record is evaluated against the configured route conditions once per batch. Each
//! downstream component then receives the records whose routes intersect the routes it declares,
//! or every record if it declares none.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::model::{Event, Record};

/// Evaluates which named routes a record matches.
pub trait RouteEvaluator: Send + Sync {
    /// The names of all routes the given record matches.
    fn evaluate(&self, record: &Record) -> HashSet<String>;
}

/// A route condition over an event.
pub type RouteCondition = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// A route evaluator over a set of named conditions.
#[derive(Clone, Default)]
pub struct ConditionalRoutes {
    routes: Vec<(String, RouteCondition)>,
}

impl ConditionalRoutes {
    /// Create a new instance with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named route matching events for which `condition` returns true.
    pub fn route(mut self, name: impl Into<String>, condition: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.routes.push((name.into(), Arc::new(condition)));
        self
    }

    /// The names of all configured routes.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(name, _)| name.as_str())
    }
}

impl RouteEvaluator for ConditionalRoutes {
    fn evaluate(&self, record: &Record) -> HashSet<String> {
        self.routes
            .iter()
            .filter(|(_, condition)| condition(record.event()))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl fmt::Debug for ConditionalRoutes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// A downstream component paired with the routes it declares interest in.
///
/// A component which declares no routes receives every record.
#[derive(Clone, Debug)]
pub struct DataFlowComponent<C> {
    name: String,
    component: C,
    routes: HashSet<String>,
}

impl<C> DataFlowComponent<C> {
    /// Create a new instance.
    pub fn new<R: Into<String>>(name: impl Into<String>, component: C, routes: impl IntoIterator<Item = R>) -> Self {
        Self {
            name: name.into(),
            component,
            routes: routes.into_iter().map(Into::into).collect(),
        }
    }

    /// The name of this component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped component.
    pub fn component(&self) -> &C {
        &self.component
    }

    /// The routes this component declares.
    pub fn routes(&self) -> &HashSet<String> {
        &self.routes
    }

    /// True if this component receives every record.
    pub fn is_catch_all(&self) -> bool {
        self.routes.is_empty()
    }

    /// The indices of the records this component should receive, given each record's matched routes.
    fn select(&self, record_routes: &[HashSet<String>]) -> Vec<usize> {
        if self.is_catch_all() {
            return (0..record_routes.len()).collect();
        }
        record_routes
            .iter()
            .enumerate()
            .filter(|(_, routes)| !routes.is_disjoint(&self.routes))
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// Decides what each destination of a record receives.
pub trait CopyStrategy: Send + Sync {
    /// The record to hand to one destination of a record delivered to `destinations` components.
    fn record_for(&self, record: &Record, destinations: usize) -> Record;
}

/// Gives every destination an independent copy whenever a record goes to more than one component.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeepCopyStrategy;

impl CopyStrategy for DeepCopyStrategy {
    fn record_for(&self, record: &Record, destinations: usize) -> Record {
        if destinations > 1 {
            record.deep_copy()
        } else {
            record.clone()
        }
    }
}

/// Totals from a single call to `Router::route`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteSummary {
    /// The number of consumer invocations.
    pub deliveries: usize,
    /// The number of records delivered to no component at all.
    pub unrouted: usize,
}

/// Fans batches of records out to downstream components by route.
#[derive(Clone)]
pub struct Router {
    evaluator: Arc<dyn RouteEvaluator>,
}

impl Router {
    /// Create a new instance.
    pub fn new(evaluator: Arc<dyn RouteEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Deliver to each component the subset of `records` it should receive.
    ///
    /// The consumer is invoked once per component with a non-empty subset. Without a copy
    /// strategy every destination receives a shared handle to the same event.
    pub fn route<C, F>(
        &self, records: &[Record], components: &[DataFlowComponent<C>], strategy: Option<&dyn CopyStrategy>, mut consumer: F,
    ) -> RouteSummary
    where
        F: FnMut(&DataFlowComponent<C>, Vec<Record>),
    {
        if records.is_empty() {
            return RouteSummary::default();
        }
        let record_routes: Vec<HashSet<String>> = if components.iter().all(|component| component.is_catch_all()) {
            vec![HashSet::new(); records.len()]
        } else {
            records.iter().map(|record| self.evaluator.evaluate(record)).collect()
        };

        let selections: Vec<Vec<usize>> = components.iter().map(|component| component.select(&record_routes)).collect();
        let mut destinations = vec![0usize; records.len()];
        selections.iter().flatten().for_each(|idx| destinations[*idx] += 1);

        let mut summary = RouteSummary {
            deliveries: 0,
            unrouted: destinations.iter().filter(|count| **count == 0).count(),
        };
        for (component, selected) in components.iter().zip(selections) {
            if selected.is_empty() {
                continue;
            }
            let subset = selected
                .into_iter()
                .map(|idx| match strategy {
                    Some(strategy) => strategy.record_for(&records[idx], destinations[idx]),
                    None => records[idx].clone(),
                })
                .collect();
            consumer(component, subset);
            summary.deliveries += 1;
        }
        summary
    }
}
