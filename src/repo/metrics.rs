//! Metric time-series storage: resource → meter → instrument → dimension →
//! bounded ring of data points. Dimensions are keyed by the limited,
//! ordered attribute tuple; each holds at most `max_metrics_count` points,
//! oldest first out.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::metrics::v1::{
    metric::Data, number_data_point, HistogramDataPoint, Metric as OtlpMetric, NumberDataPoint,
};

use crate::config::TelemetryLimitOptions;
use crate::repo::attributes::{to_limited_attributes, KeyValuePair};
use crate::repo::resources::{ResourceKey, ResourceView};
use crate::repo::scope::Scope;
use crate::repo::time::unix_nanos_to_datetime;
use crate::repo::AddContext;

/// Display name of the dimension whose attribute tuple is empty.
pub const EMPTY_DIMENSION_NAME: &str = "<empty>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Sum,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricNumber {
    Int(i64),
    Double(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramValue {
    pub count: u64,
    pub sum: f64,
    pub explicit_bounds: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// The three data-point payload shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricPayload {
    Sum(MetricNumber),
    Gauge(MetricNumber),
    Histogram(HistogramValue),
}

#[derive(Debug, Clone)]
pub struct MetricPoint {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub value: MetricPayload,
}

#[derive(Debug)]
pub struct DimensionScope {
    pub attributes: Vec<KeyValuePair>,
    points: VecDeque<MetricPoint>,
}

impl DimensionScope {
    pub fn points(&self) -> impl Iterator<Item = &MetricPoint> {
        self.points.iter()
    }

    pub fn display_name(&self) -> String {
        dimension_name(&self.attributes)
    }

    fn add_point(&mut self, point: MetricPoint, capacity: usize) {
        self.points.push_back(point);
        while self.points.len() > capacity {
            self.points.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct Instrument {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: InstrumentKind,
    /// Every value observed per attribute key, including `""` for
    /// dimensions where the key is absent. Sorted both ways.
    pub known_attribute_values: BTreeMap<String, BTreeSet<String>>,
    dimensions: HashMap<Vec<KeyValuePair>, DimensionScope>,
}

impl Instrument {
    pub fn dimensions(&self) -> impl Iterator<Item = &DimensionScope> {
        self.dimensions.values()
    }

    fn record_dimension_attributes(&mut self, attributes: &[KeyValuePair]) {
        let had_dimensions = !self.dimensions.is_empty();
        for pair in attributes {
            if !self.known_attribute_values.contains_key(&pair.key) {
                let mut initial = BTreeSet::new();
                // Older dimensions never carried this key.
                if had_dimensions {
                    initial.insert(String::new());
                }
                self.known_attribute_values.insert(pair.key.clone(), initial);
            }
            self.known_attribute_values
                .get_mut(&pair.key)
                .expect("entry ensured above")
                .insert(pair.value.clone());
        }
        for (key, values) in &mut self.known_attribute_values {
            if !attributes.iter().any(|pair| &pair.key == key) {
                values.insert(String::new());
            }
        }
    }

    fn add_point(
        &mut self,
        attributes: Vec<KeyValuePair>,
        point: MetricPoint,
        capacity: usize,
    ) {
        self.record_dimension_attributes(&attributes);
        let dimension = self
            .dimensions
            .entry(attributes.clone())
            .or_insert_with(|| DimensionScope {
                attributes,
                points: VecDeque::new(),
            });
        dimension.add_point(point, capacity);
    }
}

#[derive(Debug)]
pub struct Meter {
    pub name: String,
    pub scope: Arc<Scope>,
    instruments: BTreeMap<String, Instrument>,
}

impl Meter {
    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.values()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InstrumentSummary {
    pub meter_name: String,
    pub instrument_name: String,
    pub description: String,
    pub unit: String,
    pub kind: InstrumentKind,
}

#[derive(Debug, Clone)]
pub struct GetInstrumentRequest {
    pub resource_key: ResourceKey,
    pub meter_name: String,
    pub instrument_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DimensionSnapshot {
    pub name: String,
    pub attributes: Vec<KeyValuePair>,
    pub points: Vec<MetricPoint>,
}

#[derive(Debug, Clone)]
pub struct InstrumentSnapshot {
    pub summary: InstrumentSummary,
    pub known_attribute_values: BTreeMap<String, Vec<String>>,
    pub dimensions: Vec<DimensionSnapshot>,
}

pub struct MetricStore {
    options: TelemetryLimitOptions,
    by_resource: HashMap<ResourceKey, BTreeMap<String, Meter>>,
}

impl MetricStore {
    pub fn new(options: TelemetryLimitOptions) -> Self {
        Self {
            options,
            by_resource: HashMap::new(),
        }
    }

    /// Stores every supported data point of one decoded metric. Summary
    /// and exponential-histogram payloads, kind conflicts, and valueless
    /// points are rejections.
    pub fn add_metric(
        &mut self,
        resource_view: &Arc<ResourceView>,
        scope: &Arc<Scope>,
        metric: &OtlpMetric,
        ctx: &mut AddContext,
    ) -> bool {
        let kind = match &metric.data {
            Some(Data::Sum(_)) => InstrumentKind::Sum,
            Some(Data::Gauge(_)) => InstrumentKind::Gauge,
            Some(Data::Histogram(_)) => InstrumentKind::Histogram,
            _ => {
                tracing::debug!(metric = %metric.name, "unsupported metric payload");
                ctx.failure_count += 1;
                return false;
            }
        };

        let meters = self
            .by_resource
            .entry(resource_view.key().clone())
            .or_default();
        let meter = meters.entry(scope.name.clone()).or_insert_with(|| Meter {
            name: scope.name.clone(),
            scope: scope.clone(),
            instruments: BTreeMap::new(),
        });
        let instrument = meter
            .instruments
            .entry(metric.name.clone())
            .or_insert_with(|| Instrument {
                name: metric.name.clone(),
                description: metric.description.clone(),
                unit: metric.unit.clone(),
                kind,
                known_attribute_values: BTreeMap::new(),
                dimensions: HashMap::new(),
            });

        if instrument.kind != kind {
            tracing::debug!(
                metric = %metric.name,
                "metric payload kind conflicts with existing instrument"
            );
            ctx.failure_count += 1;
            return false;
        }
        // Metadata is set on first observation; only an empty description
        // is ever filled in later.
        if instrument.description.is_empty() && !metric.description.is_empty() {
            instrument.description = metric.description.clone();
        }

        let capacity = self.options.max_metrics_count;
        match metric.data.as_ref() {
            Some(Data::Sum(sum)) => {
                for point in &sum.data_points {
                    add_number_point(instrument, point, MetricPayload::Sum, capacity, &self.options, ctx);
                }
            }
            Some(Data::Gauge(gauge)) => {
                for point in &gauge.data_points {
                    add_number_point(instrument, point, MetricPayload::Gauge, capacity, &self.options, ctx);
                }
            }
            Some(Data::Histogram(histogram)) => {
                for point in &histogram.data_points {
                    add_histogram_point(instrument, point, capacity, &self.options);
                }
            }
            _ => unreachable!("kind resolved above"),
        }
        true
    }

    pub fn get_instrument(&self, request: &GetInstrumentRequest) -> Option<InstrumentSnapshot> {
        let instrument = self
            .by_resource
            .get(&request.resource_key)?
            .get(&request.meter_name)?
            .instruments
            .get(&request.instrument_name)?;

        let dimensions = instrument
            .dimensions
            .values()
            .map(|dimension| DimensionSnapshot {
                name: dimension.display_name(),
                attributes: dimension.attributes.clone(),
                points: dimension
                    .points()
                    .filter(|point| {
                        request.start_time.is_none_or(|start| point.end >= start)
                            && request.end_time.is_none_or(|end| point.start <= end)
                    })
                    .cloned()
                    .collect(),
            })
            .collect();

        Some(InstrumentSnapshot {
            summary: InstrumentSummary {
                meter_name: request.meter_name.clone(),
                instrument_name: instrument.name.clone(),
                description: instrument.description.clone(),
                unit: instrument.unit.clone(),
                kind: instrument.kind,
            },
            known_attribute_values: instrument
                .known_attribute_values
                .iter()
                .map(|(key, values)| (key.clone(), values.iter().cloned().collect()))
                .collect(),
            dimensions,
        })
    }

    /// Instrument metadata without data points, ordered by meter then
    /// instrument name.
    pub fn get_instruments_summaries(&self, resource_key: &ResourceKey) -> Vec<InstrumentSummary> {
        let Some(meters) = self.by_resource.get(resource_key) else {
            return Vec::new();
        };
        meters
            .values()
            .flat_map(|meter| {
                meter.instruments.values().map(|instrument| InstrumentSummary {
                    meter_name: meter.name.clone(),
                    instrument_name: instrument.name.clone(),
                    description: instrument.description.clone(),
                    unit: instrument.unit.clone(),
                    kind: instrument.kind,
                })
            })
            .collect()
    }

    pub fn clear(&mut self, resource_key: Option<&ResourceKey>) {
        match resource_key {
            None => self.by_resource.clear(),
            Some(selector) => {
                self.by_resource.retain(|key, _| !selector.matches(key));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }
}

fn add_number_point(
    instrument: &mut Instrument,
    point: &NumberDataPoint,
    wrap: impl Fn(MetricNumber) -> MetricPayload,
    capacity: usize,
    options: &TelemetryLimitOptions,
    ctx: &mut AddContext,
) {
    let number = match point.value {
        Some(number_data_point::Value::AsInt(i)) => MetricNumber::Int(i),
        Some(number_data_point::Value::AsDouble(d)) => MetricNumber::Double(d),
        None => {
            tracing::debug!(instrument = %instrument.name, "number data point without a value");
            ctx.failure_count += 1;
            return;
        }
    };
    let attributes = to_limited_attributes(&point.attributes, options);
    instrument.add_point(
        attributes,
        MetricPoint {
            start: unix_nanos_to_datetime(point.start_time_unix_nano),
            end: unix_nanos_to_datetime(point.time_unix_nano),
            value: wrap(number),
        },
        capacity,
    );
}

fn add_histogram_point(
    instrument: &mut Instrument,
    point: &HistogramDataPoint,
    capacity: usize,
    options: &TelemetryLimitOptions,
) {
    let attributes = to_limited_attributes(&point.attributes, options);
    instrument.add_point(
        attributes,
        MetricPoint {
            start: unix_nanos_to_datetime(point.start_time_unix_nano),
            end: unix_nanos_to_datetime(point.time_unix_nano),
            value: MetricPayload::Histogram(HistogramValue {
                count: point.count,
                sum: point.sum.unwrap_or(0.0),
                explicit_bounds: point.explicit_bounds.clone(),
                bucket_counts: point.bucket_counts.clone(),
                min: point.min,
                max: point.max,
            }),
        },
        capacity,
    );
}

fn dimension_name(attributes: &[KeyValuePair]) -> String {
    if attributes.is_empty() {
        return EMPTY_DIMENSION_NAME.to_string();
    }
    attributes
        .iter()
        .map(|kv| format!("{}: {}", kv.key, kv.value))
        .collect::<Vec<_>>()
        .join(", ")
}
