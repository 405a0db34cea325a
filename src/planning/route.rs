//! The planner: a transfer route turns a stream of discovered files into a
//! lazy sequence of tasks.
//!
//! A route pairs a source and target filesystem with a transfer-script
//! template and an ordered list of transformers. Planning pairs each source
//! with an initially-identical target, runs the composed I/O transformation,
//! wraps the script template with the composed script transformation, and
//! renders one task per surviving pair. The whole pipeline is single-pass;
//! only `strip_common_prefix` inherently buffers.

use std::path::Path;
use std::sync::Arc;

use crate::errors::FilesystemError;
use crate::filesystem::{Data, Filesystem};
use crate::planning::graph::{ON, PolynomialCost};
use crate::planning::templating::render_script;
use crate::planning::transform::{IoStream, IoTransformer, ScriptTransformer};
use crate::task::Task;

/// Either kind of transformer, so routes accept both through one `+=`.
pub enum RouteTransformer {
    Io(IoTransformer),
    Script(ScriptTransformer),
}

impl From<IoTransformer> for RouteTransformer {
    fn from(transformer: IoTransformer) -> Self {
        RouteTransformer::Io(transformer)
    }
}

impl From<ScriptTransformer> for RouteTransformer {
    fn from(transformer: ScriptTransformer) -> Self {
        RouteTransformer::Script(transformer)
    }
}

/// Data transfer route between two filesystems.
pub struct TransferRoute {
    source: Arc<dyn Filesystem>,
    target: Arc<dyn Filesystem>,
    script: String,
    cost: PolynomialCost,
    io: Vec<IoTransformer>,
    wrappers: Vec<ScriptTransformer>,
}

impl TransferRoute {
    /// `script` is the transfer-script template; it may use the `source` and
    /// `target` variables, each with `.filesystem` and `.address` attributes.
    pub fn new(
        source: Arc<dyn Filesystem>,
        target: Arc<dyn Filesystem>,
        script: impl Into<String>,
        cost: PolynomialCost,
    ) -> Self {
        TransferRoute {
            source,
            target,
            script: script.into(),
            cost,
            io: Vec::new(),
            wrappers: Vec::new(),
        }
    }

    pub fn source(&self) -> &Arc<dyn Filesystem> {
        &self.source
    }

    pub fn target(&self) -> &Arc<dyn Filesystem> {
        &self.target
    }

    pub fn cost(&self) -> PolynomialCost {
        self.cost
    }

    /// Transfer workers must not exceed the concurrency of either endpoint.
    pub fn max_concurrency(&self) -> u32 {
        self.source
            .max_concurrency()
            .min(self.target.max_concurrency())
    }

    /// Plan tasks from a stream of source data.
    pub fn plan_stream(
        &self,
        data: impl Iterator<Item = Data> + Send + 'static,
    ) -> impl Iterator<Item = Task> {
        // Unless a transformation says otherwise, the target address is
        // assumed to be identical to the source address
        let target_fs = Arc::clone(&self.target);
        let mut io: IoStream = Box::new(data.map(move |source| {
            let target = Data::new(Arc::clone(&target_fs), source.address.clone());
            (source, target)
        }));

        for transformer in &self.io {
            io = transformer.apply(io);
        }

        // Wrap the transfer script template before rendering
        let template = self
            .wrappers
            .iter()
            .fold(self.script.clone(), |script, wrapper| wrapper.apply(&script));

        io.map(move |(source, target)| {
            let script = render_script(&template, &source, &target);
            Task::new(script, source, target)
        })
    }

    /// Plan tasks by enumerating the source filesystem's FoFN.
    pub fn plan_fofn(
        &self,
        fofn: &Path,
        delimiter: u8,
        compressed: Option<bool>,
    ) -> Result<impl Iterator<Item = Task>, FilesystemError> {
        let source_fs = Arc::clone(&self.source);
        let addresses = self.source.enumerate_fofn(fofn, delimiter, compressed)?;
        let data = addresses.map(move |address| Data::new(Arc::clone(&source_fs), address));
        Ok(self.plan_stream(data))
    }
}

impl std::ops::AddAssign<RouteTransformer> for TransferRoute {
    /// Append a transformer to the route, accumulating its cost.
    fn add_assign(&mut self, transformer: RouteTransformer) {
        match transformer {
            RouteTransformer::Io(t) => {
                self.cost = self.cost + t.cost();
                self.io.push(t);
            }
            RouteTransformer::Script(t) => {
                self.cost = self.cost + t.cost();
                self.wrappers.push(t);
            }
        }
    }
}

impl std::ops::AddAssign<IoTransformer> for TransferRoute {
    fn add_assign(&mut self, transformer: IoTransformer) {
        *self += RouteTransformer::from(transformer);
    }
}

impl std::ops::AddAssign<ScriptTransformer> for TransferRoute {
    fn add_assign(&mut self, transformer: ScriptTransformer) {
        *self += RouteTransformer::from(transformer);
    }
}

const POSIX_TO_IRODS_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail

declare target="{{ target.address | sh_escape }}"

imkdir -p "$(dirname "${target}")"
iput -K -f "{{ source.address | sh_escape }}" "${target}"
"#;

/// The stock POSIX→iRODS route.
pub fn posix_to_irods(
    posix: Arc<dyn Filesystem>,
    irods: Arc<dyn Filesystem>,
    cost: PolynomialCost,
) -> TransferRoute {
    TransferRoute::new(posix, irods, POSIX_TO_IRODS_SCRIPT, cost)
}

/// The stock POSIX→iRODS route at linear cost.
pub fn posix_to_irods_factory(
    posix: Arc<dyn Filesystem>,
    irods: Arc<dyn Filesystem>,
) -> TransferRoute {
    posix_to_irods(posix, irods, ON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::{MockFilesystem, mock_data};
    use crate::planning::graph::{O1, ON2};
    use crate::planning::transformers::{prefix, strip_common_prefix, telemetry};
    use crate::planning::transform::ScriptTransformer;

    fn route() -> TransferRoute {
        TransferRoute::new(
            MockFilesystem::new("Lustre"),
            MockFilesystem::new("iRODS"),
            "copy {{source.address}} {{target.address}}",
            ON,
        )
    }

    fn sources(addresses: &[&str]) -> Vec<Data> {
        addresses.iter().map(|a| mock_data("Lustre", a)).collect()
    }

    #[test]
    fn targets_default_to_the_source_address() {
        let route = route();
        let tasks: Vec<_> = route.plan_stream(sources(&["/a/b"]).into_iter()).collect();

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source.address, Path::new("/a/b"));
        assert_eq!(tasks[0].target.address, Path::new("/a/b"));
        assert_eq!(tasks[0].source.filesystem.name(), "Lustre");
        assert_eq!(tasks[0].target.filesystem.name(), "iRODS");
    }

    #[test]
    fn scripts_are_rendered_per_pair() {
        let route = route();
        let tasks: Vec<_> = route
            .plan_stream(sources(&["/x", "/y"]).into_iter())
            .collect();

        assert_eq!(tasks[0].script, "copy /x /x");
        assert_eq!(tasks[1].script, "copy /y /y");
    }

    #[test]
    fn io_transformers_apply_in_insertion_order() {
        let mut route = route();
        route += strip_common_prefix();
        route += prefix("/irods/base/coll");

        let tasks: Vec<_> = route
            .plan_stream(sources(&["/lustre/a/b.dat"]).into_iter())
            .collect();

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].target.address, Path::new("/irods/base/coll/b.dat"));
        assert_eq!(tasks[0].script, "copy /lustre/a/b.dat /irods/base/coll/b.dat");
    }

    #[test]
    fn script_transformers_wrap_outermost_last() {
        let mut route = route();
        route += ScriptTransformer::new("inner<[[script]]>", O1);
        route += ScriptTransformer::new("outer<[[script]]>", O1);

        let tasks: Vec<_> = route.plan_stream(sources(&["/x"]).into_iter()).collect();
        assert_eq!(tasks[0].script, "outer<inner<copy /x /x>>");
    }

    #[test]
    fn wrapper_variables_render_with_the_inner_script() {
        let mut route = route();
        route += telemetry();

        let tasks: Vec<_> = route.plan_stream(sources(&["/a"]).into_iter()).collect();
        let script = &tasks[0].script;
        assert!(script.contains("copy /a /a"));
        assert!(script.contains("## Source: Lustre /a"));
        assert!(script.contains("## Target: iRODS /a"));
    }

    #[test]
    fn appending_transformers_accumulates_cost_by_max() {
        let mut route = route();
        assert_eq!(route.cost(), ON);

        route += IoTransformer::new(ON2, |io| io);
        assert_eq!(route.cost(), ON2);

        route += ScriptTransformer::new("[[script]]", O1);
        assert_eq!(route.cost(), ON2);
    }

    #[test]
    fn empty_streams_plan_zero_tasks() {
        let route = route();
        assert_eq!(route.plan_stream(std::iter::empty()).count(), 0);
    }

    #[test]
    fn concurrency_is_bounded_by_both_endpoints() {
        let posix = Arc::new(crate::filesystem::PosixFilesystem::new("Lustre", 50));
        let irods = Arc::new(crate::filesystem::IrodsFilesystem::new("iRODS", 10));
        let route = posix_to_irods_factory(posix, irods);
        assert_eq!(route.max_concurrency(), 10);
    }

    #[test]
    fn stock_script_quotes_its_endpoints() {
        let posix: Arc<dyn Filesystem> = MockFilesystem::new("Lustre");
        let irods: Arc<dyn Filesystem> = MockFilesystem::new("iRODS");
        let route = posix_to_irods_factory(posix, irods);

        let tasks: Vec<_> = route
            .plan_stream(sources(&["/lustre/$x/a.dat"]).into_iter())
            .collect();
        assert!(tasks[0].script.contains(r#"iput -K -f "/lustre/\$x/a.dat""#));
    }
}
