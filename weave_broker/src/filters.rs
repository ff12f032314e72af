//! Message filters.
//!
//! Filters attach to endpoints and rewrite message traffic: shift delivery
//! times, drop probabilistically, reroute, clone to auxiliary destinations,
//! or run arbitrary user code. The built-in operations are plain data and can
//! be shipped to whichever core owns the target endpoint; user callbacks
//! (custom transforms and firewall rules) run only in the core that
//! registered them.

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};

use weave_core::Time;

/// A message in flight between endpoints, as seen by filters and the
/// federate message API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMessage {
    /// Source endpoint name.
    pub source: String,
    /// Source before any filter rewrote it.
    pub original_source: String,
    /// Destination endpoint name.
    pub destination: String,
    /// Destination before any filter rewrote it.
    pub original_destination: String,
    pub time: Time,
    pub payload: Bytes,
}

impl EndpointMessage {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        time: Time,
        payload: impl Into<Bytes>,
    ) -> Self {
        let source = source.into();
        let destination = destination.into();
        Self {
            original_source: source.clone(),
            original_destination: destination.clone(),
            source,
            destination,
            time,
            payload: payload.into(),
        }
    }
}

/// User-supplied message transform. One instance per registered filter;
/// invoked from the owning core's dispatch loop.
pub trait FilterOperator: Send + 'static {
    fn process(&mut self, msg: EndpointMessage) -> Option<EndpointMessage>;
}

impl<F> FilterOperator for F
where
    F: FnMut(EndpointMessage) -> Option<EndpointMessage> + Send + 'static,
{
    fn process(&mut self, msg: EndpointMessage) -> Option<EndpointMessage> {
        self(msg)
    }
}

/// User-supplied firewall predicate; messages it refuses are dropped.
pub trait FirewallRule: Send + 'static {
    fn allow(&self, msg: &EndpointMessage) -> bool;
}

impl<F> FirewallRule for F
where
    F: Fn(&EndpointMessage) -> bool + Send + 'static,
{
    fn allow(&self, msg: &EndpointMessage) -> bool {
        self(msg)
    }
}

/// Distribution for [`FilterSpec::RandomDelay`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DelayDistribution {
    Uniform { min: f64, max: f64 },
    Exponential { mean: f64 },
}

impl DelayDistribution {
    fn sample(&self, rng: &mut impl Rng) -> Time {
        let seconds = match *self {
            DelayDistribution::Uniform { min, max } if max > min => rng.gen_range(min..max),
            DelayDistribution::Uniform { min, .. } => min,
            DelayDistribution::Exponential { mean } => {
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                -mean * u.ln()
            }
        };
        Time::from_seconds(seconds.max(0.0))
    }
}

/// The serializable filter operations; these can run in any core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterSpec {
    /// Shift delivery time by a fixed amount.
    Delay { delay: Time },
    /// Shift delivery time by a random draw.
    RandomDelay { dist: DelayDistribution },
    /// Drop with the given probability.
    RandomDrop { probability: f64 },
    /// Redirect messages whose destination matches `pattern` to `new_destination`.
    Reroute {
        pattern: String,
        new_destination: String,
    },
    /// Deliver a copy to each listed endpoint; the original passes through.
    Clone { deliveries: Vec<String> },
}

impl FilterSpec {
    /// Parse the filter-type string used at registration.
    pub fn parse(kind: &str, args: &str) -> Option<FilterSpec> {
        match kind.to_ascii_lowercase().as_str() {
            "delay" => Some(FilterSpec::Delay {
                delay: Time::from_seconds(args.parse().ok()?),
            }),
            "random_delay" | "randomdelay" => Some(FilterSpec::RandomDelay {
                dist: DelayDistribution::Exponential {
                    mean: args.parse().ok()?,
                },
            }),
            "random_drop" | "randomdrop" => Some(FilterSpec::RandomDrop {
                probability: args.parse().ok()?,
            }),
            "reroute" => {
                let (pattern, new_destination) = args.split_once("->")?;
                Some(FilterSpec::Reroute {
                    pattern: pattern.trim().to_owned(),
                    new_destination: new_destination.trim().to_owned(),
                })
            }
            "clone" => Some(FilterSpec::Clone {
                deliveries: args
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect(),
            }),
            _ => None,
        }
    }
}

/// One installed filter stage.
pub enum FilterStage {
    Builtin(FilterSpec),
    Firewall(Box<dyn FirewallRule>),
    Custom(Box<dyn FilterOperator>),
}

impl std::fmt::Debug for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterStage::Builtin(spec) => f.debug_tuple("Builtin").field(spec).finish(),
            FilterStage::Firewall(_) => f.write_str("Firewall"),
            FilterStage::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Result of pushing one message through a pipeline.
#[derive(Debug, Default)]
pub struct FilterOutput {
    /// The message to deliver onward, unless dropped.
    pub message: Option<EndpointMessage>,
    /// Copies produced by cloning stages.
    pub clones: Vec<EndpointMessage>,
}

/// An ordered list of filter stages for one endpoint.
#[derive(Debug, Default)]
pub struct FilterPipeline {
    stages: Vec<FilterStage>,
}

impl FilterPipeline {
    pub fn push(&mut self, stage: FilterStage) {
        self.stages.push(stage);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `msg` through every stage in order.
    pub fn apply(&mut self, msg: EndpointMessage, rng: &mut impl Rng) -> FilterOutput {
        let mut out = FilterOutput::default();
        let mut current = msg;

        for stage in &mut self.stages {
            match stage {
                FilterStage::Builtin(FilterSpec::Delay { delay }) => {
                    current.time += *delay;
                }
                FilterStage::Builtin(FilterSpec::RandomDelay { dist }) => {
                    current.time += dist.sample(rng);
                }
                FilterStage::Builtin(FilterSpec::RandomDrop { probability }) => {
                    if rng.gen::<f64>() < *probability {
                        return out;
                    }
                }
                FilterStage::Builtin(FilterSpec::Reroute {
                    pattern,
                    new_destination,
                }) => {
                    if matches_pattern(pattern, &current.destination) {
                        current.destination = new_destination.clone();
                    }
                }
                FilterStage::Builtin(FilterSpec::Clone { deliveries }) => {
                    for delivery in deliveries.iter() {
                        let mut copy = current.clone();
                        copy.destination = delivery.clone();
                        out.clones.push(copy);
                    }
                }
                FilterStage::Firewall(rule) => {
                    if !rule.allow(&current) {
                        return out;
                    }
                }
                FilterStage::Custom(op) => match op.process(current) {
                    Some(next) => current = next,
                    None => return out,
                },
            }
        }

        out.message = Some(current);
        out
    }
}

/// Destination matching for reroute filters: exact, or a single trailing `*`
/// wildcard.
fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern.is_empty() || pattern == name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    fn msg(t: f64) -> EndpointMessage {
        EndpointMessage::new("src/ep", "dst/ep", Time::from_seconds(t), "hello")
    }

    #[test]
    fn delay_shifts_delivery_time() {
        let mut pipeline = FilterPipeline::default();
        pipeline.push(FilterStage::Builtin(FilterSpec::Delay {
            delay: Time::from_seconds(0.5),
        }));
        let mut rng = SmallRng::seed_from_u64(1);
        let out = pipeline.apply(msg(1.0), &mut rng);
        assert_eq!(out.message.unwrap().time, Time::from_seconds(1.5));
    }

    #[test]
    fn drop_filter_at_probability_one_drops_everything() {
        let mut pipeline = FilterPipeline::default();
        pipeline.push(FilterStage::Builtin(FilterSpec::RandomDrop {
            probability: 1.0,
        }));
        let mut rng = SmallRng::seed_from_u64(1);
        let out = pipeline.apply(msg(1.0), &mut rng);
        assert!(out.message.is_none());
        assert!(out.clones.is_empty());
    }

    #[test]
    fn reroute_matches_patterns() {
        let mut pipeline = FilterPipeline::default();
        pipeline.push(FilterStage::Builtin(FilterSpec::Reroute {
            pattern: "dst/*".into(),
            new_destination: "quarantine".into(),
        }));
        let mut rng = SmallRng::seed_from_u64(1);
        let out = pipeline.apply(msg(1.0), &mut rng);
        let delivered = out.message.unwrap();
        assert_eq!(delivered.destination, "quarantine");
        assert_eq!(delivered.original_destination, "dst/ep");
    }

    #[test]
    fn clone_produces_copies_and_passes_original() {
        let mut pipeline = FilterPipeline::default();
        pipeline.push(FilterStage::Builtin(FilterSpec::Clone {
            deliveries: vec!["tap1".into(), "tap2".into()],
        }));
        let mut rng = SmallRng::seed_from_u64(1);
        let out = pipeline.apply(msg(1.0), &mut rng);
        assert_eq!(out.message.unwrap().destination, "dst/ep");
        assert_eq!(out.clones.len(), 2);
        assert_eq!(out.clones[0].destination, "tap1");
    }

    #[test]
    fn firewall_and_custom_stages() {
        let mut pipeline = FilterPipeline::default();
        pipeline.push(FilterStage::Firewall(Box::new(|m: &EndpointMessage| {
            m.payload.len() < 100
        })));
        pipeline.push(FilterStage::Custom(Box::new(
            |mut m: EndpointMessage| -> Option<EndpointMessage> {
                m.payload = Bytes::from(m.payload.to_ascii_uppercase());
                Some(m)
            },
        )));
        let mut rng = SmallRng::seed_from_u64(1);
        let out = pipeline.apply(msg(1.0), &mut rng);
        assert_eq!(out.message.unwrap().payload.as_ref(), b"HELLO");

        let mut big = msg(1.0);
        big.payload = Bytes::from(vec![b'x'; 200]);
        let out = pipeline.apply(big, &mut rng);
        assert!(out.message.is_none());
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(
            FilterSpec::parse("delay", "0.25"),
            Some(FilterSpec::Delay {
                delay: Time::from_seconds(0.25)
            })
        );
        assert!(matches!(
            FilterSpec::parse("reroute", "a* -> b"),
            Some(FilterSpec::Reroute { .. })
        ));
        assert!(FilterSpec::parse("teleport", "").is_none());
    }
}
