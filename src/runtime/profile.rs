// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Runtime profile counters for operators.
//!
//! Responsibilities:
//! - Maintains named atomic counters, highwater marks, and timers per operator.
//! - Supports nested child profiles and info strings for plan text rendering.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TUnit {
    Unit,
    Bytes,
    TimeNs,
    Percent,
}

#[derive(Debug)]
pub struct Counter {
    name: String,
    unit: TUnit,
    value: AtomicI64,
}

pub type CounterRef = Arc<Counter>;

impl Counter {
    pub fn new(name: impl Into<String>, unit: TUnit) -> CounterRef {
        Arc::new(Self {
            name: name.into(),
            unit,
            value: AtomicI64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> TUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Raise the counter to `value` if it is larger than the current value.
    pub fn set_max(&self, value: i64) {
        let mut prev = self.value.load(Ordering::Relaxed);
        while value > prev {
            match self
                .value
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct ProfileInner {
    counters: BTreeMap<String, CounterRef>,
    info_strings: BTreeMap<String, String>,
    children: Vec<RuntimeProfile>,
}

/// A named tree of counters shared by reference.
#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    name: String,
    inner: Arc<Mutex<ProfileInner>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(ProfileInner::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get or create a child profile with the given name.
    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = inner.children.iter().find(|c| c.name == name) {
            return child.clone();
        }
        let child = RuntimeProfile::new(name);
        inner.children.push(child.clone());
        child
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.info_strings.insert(key.into(), value.into());
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.info_strings.get(key).cloned()
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: TUnit) -> CounterRef {
        let name = name.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            inner
                .counters
                .entry(name.clone())
                .or_insert_with(|| Counter::new(name, unit)),
        )
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, TUnit::TimeNs)
    }

    pub fn counter(&self, name: &str) -> Option<CounterRef> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.counters.get(name).map(Arc::clone)
    }

    pub fn counter_value(&self, name: &str) -> i64 {
        self.counter(name).map(|c| c.value()).unwrap_or(0)
    }

    pub fn scoped_timer(&self, name: &str) -> Option<ScopedTimer> {
        self.counter(name).map(ScopedTimer::new)
    }
}

/// Adds the elapsed wall time to the wrapped timer counter on drop.
pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_nanos();
        self.counter.add(i64::try_from(elapsed).unwrap_or(i64::MAX));
    }
}
