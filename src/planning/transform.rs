//! Transformation algebra: two monoids composed over a route.
//!
//! An I/O transformer rewrites the stream of `(source, target)` pairs the
//! planner feeds through a route; a script transformer wraps the transfer
//! script with an outer template. Both compose left-to-right, `(f + g)(x) =
//! g(f(x))`, so appending transformers to a route applies them in the order
//! they were added. Costs combine by `max`.

use crate::filesystem::Data;
use crate::planning::graph::{O1, ON, PolynomialCost};
use crate::planning::templating::wrap_script;

/// The planner's stream of (source, target) pairs.
pub type IoStream = Box<dyn Iterator<Item = (Data, Data)> + Send>;

/// A cost-bearing function over the I/O stream.
pub struct IoTransformer {
    func: Box<dyn Fn(IoStream) -> IoStream + Send + Sync>,
    cost: PolynomialCost,
}

impl IoTransformer {
    pub fn new(
        cost: PolynomialCost,
        func: impl Fn(IoStream) -> IoStream + Send + Sync + 'static,
    ) -> Self {
        IoTransformer {
            func: Box::new(func),
            cost,
        }
    }

    /// The monoid identity: passes the stream through.
    pub fn identity() -> Self {
        IoTransformer::new(O1, |io| io)
    }

    /// Convenience constructor for the common per-pair rewrite at linear
    /// cost.
    pub fn for_each(rewrite: impl Fn((Data, Data)) -> (Data, Data) + Send + Sync + 'static) -> Self {
        let rewrite = std::sync::Arc::new(rewrite);
        IoTransformer::new(ON, move |io| {
            let rewrite = std::sync::Arc::clone(&rewrite);
            Box::new(io.map(move |pair| rewrite(pair)))
        })
    }

    pub fn apply(&self, io: IoStream) -> IoStream {
        (self.func)(io)
    }

    pub fn cost(&self) -> PolynomialCost {
        self.cost
    }

    /// Left-to-right composition: `self` first, then `rhs`.
    pub fn then(self, rhs: IoTransformer) -> IoTransformer {
        let cost = self.cost + rhs.cost;
        IoTransformer::new(cost, move |io| (rhs.func)((self.func)(io)))
    }
}

/// A cost-bearing wrapper around the transfer script.
///
/// The wrapper template exposes a `[[ script ]]` placeholder; applying the
/// transformer substitutes the inner script into it. The identity carries no
/// wrapper and returns the script unchanged.
pub struct ScriptTransformer {
    wrapper: Option<String>,
    cost: PolynomialCost,
}

impl ScriptTransformer {
    pub fn new(wrapper: impl Into<String>, cost: PolynomialCost) -> Self {
        ScriptTransformer {
            wrapper: Some(wrapper.into()),
            cost,
        }
    }

    pub fn identity() -> Self {
        ScriptTransformer {
            wrapper: None,
            cost: O1,
        }
    }

    pub fn apply(&self, script: &str) -> String {
        match &self.wrapper {
            None => script.to_string(),
            Some(wrapper) => wrap_script(wrapper, script),
        }
    }

    pub fn cost(&self) -> PolynomialCost {
        self.cost
    }

    /// Left-to-right composition: the combined wrapper substitutes `self`'s
    /// wrapper into `rhs`'s, so `rhs` ends up outermost.
    pub fn then(self, rhs: ScriptTransformer) -> ScriptTransformer {
        let cost = self.cost + rhs.cost;
        match (self.wrapper, rhs.wrapper) {
            (None, wrapper) | (wrapper, None) => ScriptTransformer { wrapper, cost },
            (Some(inner), Some(outer)) => ScriptTransformer {
                wrapper: Some(wrap_script(&outer, &inner)),
                cost,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::mock_data;
    use crate::planning::graph::ON2;

    fn pairs(addresses: &[&str]) -> IoStream {
        let data: Vec<(Data, Data)> = addresses
            .iter()
            .map(|a| (mock_data("src", a), mock_data("tgt", a)))
            .collect();
        Box::new(data.into_iter())
    }

    fn targets(io: IoStream) -> Vec<String> {
        io.map(|(_, t)| t.address.display().to_string()).collect()
    }

    fn suffixer(suffix: &'static str) -> IoTransformer {
        IoTransformer::for_each(move |(source, mut target)| {
            let address = format!("{}{}", target.address.display(), suffix);
            target.address = address.into();
            (source, target)
        })
    }

    #[test]
    fn identity_passes_the_stream_through() {
        let out = targets(IoTransformer::identity().apply(pairs(&["/a", "/b"])));
        assert_eq!(out, vec!["/a", "/b"]);
    }

    #[test]
    fn io_composition_is_left_to_right() {
        let composed = suffixer(".one").then(suffixer(".two"));
        let out = targets(composed.apply(pairs(&["/a"])));
        assert_eq!(out, vec!["/a.one.two"]);
    }

    #[test]
    fn io_composition_cost_is_max() {
        let cheap = IoTransformer::new(O1, |io| io);
        let dear = IoTransformer::new(ON2, |io| io);
        assert_eq!(cheap.then(dear).cost(), ON2);
    }

    #[test]
    fn script_identity_returns_the_input() {
        assert_eq!(ScriptTransformer::identity().apply("echo hi"), "echo hi");
    }

    #[test]
    fn script_composition_puts_the_rhs_outermost() {
        let f = ScriptTransformer::new("f([[script]])", O1);
        let g = ScriptTransformer::new("g([[script]])", O1);
        assert_eq!(f.then(g).apply("x"), "g(f(x))");
    }

    #[test]
    fn script_identity_is_neutral_on_both_sides() {
        let f = ScriptTransformer::new("f([[script]])", O1);
        assert_eq!(ScriptTransformer::identity().then(f).apply("x"), "f(x)");

        let f = ScriptTransformer::new("f([[script]])", O1);
        assert_eq!(f.then(ScriptTransformer::identity()).apply("x"), "f(x)");
    }
}
