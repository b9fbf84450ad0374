//! Instrumentation scope: the `(name, version, attributes)` triple every
//! log record, span, and meter carries. A canonical empty scope is shared
//! so records without one don't allocate.

use std::sync::{Arc, OnceLock};

use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
use serde::Serialize;

use crate::config::TelemetryLimitOptions;
use crate::repo::attributes::{to_limited_attributes, KeyValuePair};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scope {
    pub name: String,
    pub version: String,
    pub attributes: Vec<KeyValuePair>,
}

impl Scope {
    pub fn from_otlp(
        scope: Option<&InstrumentationScope>,
        options: &TelemetryLimitOptions,
    ) -> Arc<Scope> {
        match scope {
            None => Scope::empty(),
            Some(s) if s.name.is_empty() && s.version.is_empty() && s.attributes.is_empty() => {
                Scope::empty()
            }
            Some(s) => Arc::new(Scope {
                name: s.name.clone(),
                version: s.version.clone(),
                attributes: to_limited_attributes(&s.attributes, options),
            }),
        }
    }

    pub fn empty() -> Arc<Scope> {
        static EMPTY: OnceLock<Arc<Scope>> = OnceLock::new();
        EMPTY
            .get_or_init(|| {
                Arc::new(Scope {
                    name: String::new(),
                    version: String::new(),
                    attributes: Vec::new(),
                })
            })
            .clone()
    }
}
