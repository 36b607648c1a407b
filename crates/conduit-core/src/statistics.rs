// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duration and count statistics, and their export.
//!
//! Components push their statistics into a [`StatisticsIterationHandler`],
//! which decides how to render them. [`JsonStatisticsHandler`] builds a
//! `serde_json` tree suitable for an administrative API.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

/// What an export should include and whether it resets interval values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsAction {
    /// Top-level values only.
    Summary,
    /// All groups, nothing reset.
    Full,
    /// All groups, then start a new interval.
    MarkFull,
    /// All groups, then start a new interval and clear duration keepers.
    Reset,
}

impl StatisticsAction {
    /// Whether nested groups are exported.
    pub fn includes_groups(&self) -> bool {
        !matches!(self, Self::Summary)
    }

    /// Whether interval values are marked after export.
    pub fn marks_interval(&self) -> bool {
        matches!(self, Self::MarkFull | Self::Reset)
    }
}

/// Aggregated duration samples in milliseconds.
#[derive(Debug, Clone)]
pub struct StatisticsKeeper {
    name: String,
    count: u64,
    min: u64,
    max: u64,
    sum: u64,
    sum_of_squares: f64,
    interval_count: u64,
    interval_sum: u64,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl StatisticsKeeper {
    /// Create an empty keeper.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 0,
            min: u64::MAX,
            max: 0,
            sum: 0,
            sum_of_squares: 0.0,
            interval_count: 0,
            interval_sum: 0,
            first: None,
            last: None,
        }
    }

    /// Add one sample.
    pub fn add_value(&mut self, value: u64) {
        let now = Utc::now();
        if self.first.is_none() {
            self.first = Some(now);
        }
        self.last = Some(now);
        self.count += 1;
        self.interval_count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum = self.sum.saturating_add(value);
        self.interval_sum = self.interval_sum.saturating_add(value);
        self.sum_of_squares += (value as f64) * (value as f64);
    }

    /// Name of this keeper.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Smallest sample.
    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest sample.
    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    /// Sum of all samples.
    pub fn total(&self) -> u64 {
        self.sum
    }

    /// Mean of all samples.
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }

    /// Sample standard deviation.
    pub fn std_dev(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum as f64 / n;
        let variance = (self.sum_of_squares - n * mean * mean) / (n - 1.0);
        Some(variance.max(0.0).sqrt())
    }

    /// Samples added since the last [`mark`](Self::mark).
    pub fn interval_count(&self) -> u64 {
        self.interval_count
    }

    /// Time of the most recent sample.
    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    /// Start a new interval.
    pub fn mark(&mut self) {
        self.interval_count = 0;
        self.interval_sum = 0;
    }

    /// Discard every sample.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.name));
    }

    /// Render this keeper as JSON.
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "count": self.count,
            "min": self.min(),
            "max": self.max(),
            "avg": self.avg(),
            "stdDev": self.std_dev(),
            "sum": self.sum,
            "intervalCount": self.interval_count,
            "intervalSum": self.interval_sum,
            "first": self.first,
            "last": self.last,
        })
    }
}

/// Monotonic counter with an interval mark.
#[derive(Debug, Default)]
pub struct CounterStatistic {
    value: AtomicU64,
    mark: AtomicU64,
}

impl CounterStatistic {
    /// Create a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Increase since the last mark.
    pub fn interval_value(&self) -> u64 {
        self.value().saturating_sub(self.mark.load(Ordering::SeqCst))
    }

    /// Start a new interval.
    pub fn mark(&self) {
        self.mark.store(self.value(), Ordering::SeqCst);
    }
}

/// A single exported value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// A count.
    Integer(i64),
    /// A point in time, absent when it never happened.
    Date(Option<DateTime<Utc>>),
    /// Free text.
    Text(String),
}

/// Visitor receiving a component's statistics tree.
pub trait StatisticsIterationHandler {
    /// Enter a named group.
    fn open_group(&mut self, name: &str, kind: &str);
    /// Leave the most recently opened group.
    fn close_group(&mut self);
    /// Receive a single value in the current group.
    fn handle_scalar(&mut self, name: &str, value: ScalarValue);
    /// Receive a duration keeper in the current group.
    fn handle_statistics_keeper(&mut self, keeper: &StatisticsKeeper);
}

/// Renders a statistics tree as JSON.
#[derive(Debug)]
pub struct JsonStatisticsHandler {
    stack: Vec<(String, Map<String, Value>)>,
}

impl Default for JsonStatisticsHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonStatisticsHandler {
    /// Create a handler with an empty root object.
    pub fn new() -> Self {
        Self {
            stack: vec![(String::new(), Map::new())],
        }
    }

    /// Finish and return the root object. Unclosed groups are closed.
    pub fn into_value(mut self) -> Value {
        while self.stack.len() > 1 {
            self.close_group();
        }
        match self.stack.pop() {
            Some((_, root)) => Value::Object(root),
            None => Value::Object(Map::new()),
        }
    }

    fn current(&mut self) -> &mut Map<String, Value> {
        if self.stack.is_empty() {
            self.stack.push((String::new(), Map::new()));
        }
        let last = self.stack.len() - 1;
        &mut self.stack[last].1
    }
}

impl StatisticsIterationHandler for JsonStatisticsHandler {
    fn open_group(&mut self, name: &str, kind: &str) {
        let mut group = Map::new();
        group.insert("type".to_string(), Value::String(kind.to_string()));
        self.stack.push((name.to_string(), group));
    }

    fn close_group(&mut self) {
        if self.stack.len() < 2 {
            return;
        }
        if let Some((name, group)) = self.stack.pop() {
            self.current().insert(name, Value::Object(group));
        }
    }

    fn handle_scalar(&mut self, name: &str, value: ScalarValue) {
        let value = match value {
            ScalarValue::Integer(i) => Value::from(i),
            ScalarValue::Date(d) => d.map_or(Value::Null, |d| Value::String(d.to_rfc3339())),
            ScalarValue::Text(t) => Value::String(t),
        };
        self.current().insert(name.to_string(), value);
    }

    fn handle_statistics_keeper(&mut self, keeper: &StatisticsKeeper) {
        let name = keeper.name().to_string();
        let value = keeper.to_json();
        self.current().insert(name, value);
    }
}
