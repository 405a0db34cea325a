//! Stock route transformers.
//!
//! I/O transformers rewrite target addresses as pairs stream through the
//! planner; script transformers wrap the transfer script. All of them are
//! plain values appended to a `TransferRoute` with `+=`.

use std::path::{Component, Path, PathBuf};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::filesystem::Data;
use crate::planning::graph::{O1, ON};
use crate::planning::transform::{IoStream, IoTransformer, ScriptTransformer};

/// Characters that survive percent encoding untouched (alphanumerics are
/// never encoded).
const KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'(')
    .remove(b')')
    .remove(b'[')
    .remove(b']')
    .remove(b'{')
    .remove(b'}')
    .remove(b'-')
    .remove(b'_')
    .remove(b'#')
    .remove(b'%')
    .remove(b'&')
    .remove(b'+')
    .remove(b',')
    .remove(b'.')
    .remove(b':')
    .remove(b';')
    .remove(b'<')
    .remove(b'>')
    .remove(b'=')
    .remove(b'@')
    .remove(b'$');

fn components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

fn from_components(parts: impl IntoIterator<Item = String>) -> PathBuf {
    let mut path = PathBuf::from("/");
    path.extend(parts);
    path
}

fn retarget(target: Data, address: PathBuf) -> Data {
    Data {
        filesystem: target.filesystem,
        address,
    }
}

/// Longest common path prefix of two directories.
fn common_prefix(a: &Path, b: &Path) -> PathBuf {
    let shared = components(a)
        .into_iter()
        .zip(components(b))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x);
    from_components(shared)
}

/// Strip the longest common directory prefix from all target addresses.
///
/// The prefix is computed over the targets' parent directories, so a
/// stream of one still keeps its file name. Inherently buffers: the prefix
/// is only known once the stream is exhausted.
pub fn strip_common_prefix() -> IoTransformer {
    IoTransformer::new(ON, |io: IoStream| {
        let buffer: Vec<(Data, Data)> = io.collect();

        let prefix = buffer
            .iter()
            .map(|(_, target)| target.address.parent().unwrap_or(Path::new("/")))
            .fold(None::<PathBuf>, |acc, parent| match acc {
                None => Some(parent.to_path_buf()),
                Some(prefix) => Some(common_prefix(&prefix, parent)),
            })
            .unwrap_or_else(|| PathBuf::from("/"));

        Box::new(buffer.into_iter().map(move |(source, target)| {
            let stripped = target
                .address
                .strip_prefix(&prefix)
                .map(|rest| Path::new("/").join(rest))
                .unwrap_or_else(|_| target.address.clone());
            (source, retarget(target, stripped))
        }))
    })
}

/// Prepend an absolute path to each target address.
pub fn prefix(prefix: impl Into<PathBuf>) -> IoTransformer {
    let prefix = prefix.into();
    assert!(prefix.is_absolute(), "prefix must be an absolute path");

    IoTransformer::for_each(move |(source, target)| {
        let mut address = prefix.clone();
        address.extend(components(&target.address));
        (source, retarget(target, address))
    })
}

/// Keep, at most, the last n path components of each target address.
pub fn last_n_components(n: usize) -> IoTransformer {
    assert!(n > 0);

    IoTransformer::for_each(move |(source, target)| {
        let parts = components(&target.address);
        let keep = parts.len().saturating_sub(n);
        let address = from_components(parts.into_iter().skip(keep));
        (source, retarget(target, address))
    })
}

/// Percent-encode each target path component using a fixed safe set.
pub fn percent_encode() -> IoTransformer {
    IoTransformer::for_each(|(source, target)| {
        let encoded = components(&target.address)
            .into_iter()
            .map(|part| utf8_percent_encode(&part, KEEP).to_string());
        let address = from_components(encoded);
        (source, retarget(target, address))
    })
}

/// Substring-replace on each target path component, or on the file name only.
pub fn character_translate(
    from: impl Into<String>,
    to: impl Into<String>,
    name_only: bool,
) -> IoTransformer {
    let from = from.into();
    let to = to.into();

    IoTransformer::for_each(move |(source, target)| {
        let address = if name_only {
            let name = target
                .address
                .file_name()
                .map(|n| n.to_string_lossy().replace(&from, &to))
                .unwrap_or_default();
            target
                .address
                .parent()
                .unwrap_or(Path::new("/"))
                .join(name)
        } else {
            from_components(
                components(&target.address)
                    .into_iter()
                    .map(|part| part.replace(&from, &to)),
            )
        };
        (source, retarget(target, address))
    })
}

const TELEMETRY: &str = r#"#!/usr/bin/env bash
declare start="$(date +%s)"

cat >&2 <<-EOF
	#### START TELEMETRY ###################################################
	## Source: {{ source.filesystem }} {{ source.address | sh_escape }}
	## Target: {{ target.filesystem }} {{ target.address | sh_escape }}
	## Username: $(id -un) ($(id -u))
	## Hostname: $(hostname)
	## Start Time: $(date -d "@${start}")
	## Environment:
	$(env | sed 's/^/## * /')
	#### START EXECUTION ###################################################
	EOF

# Run script in subshell
(
[[ script ]]
)

declare exit_status="$?"
declare finish="$(date +%s)"
declare runtime="$(( finish - start ))"

cat >&2 <<-EOF
	#### END EXECUTION #####################################################
	## Exit Status: ${exit_status}
	## Finish Time: $(date -d "@${finish}")
	## Run Time: ${runtime} seconds
	#### END TELEMETRY #####################################################
	EOF

# Thread exit status through
exit "${exit_status}"
"#;

const DEBUGGING: &str = "#!/usr/bin/env bash\nset -x\n\n[[ script ]]\n";

/// Wrap the script with start/finish timestamping, host, user and
/// environment capture; the inner exit status is threaded through.
pub fn telemetry() -> ScriptTransformer {
    ScriptTransformer::new(TELEMETRY, O1)
}

/// Enable shell execution tracing around the script.
pub fn debugging() -> ScriptTransformer {
    ScriptTransformer::new(DEBUGGING, O1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::mock_data;

    fn stream(addresses: &[&str]) -> IoStream {
        let pairs: Vec<(Data, Data)> = addresses
            .iter()
            .map(|a| (mock_data("src", a), mock_data("tgt", a)))
            .collect();
        Box::new(pairs.into_iter())
    }

    fn targets(io: IoStream) -> Vec<String> {
        io.map(|(_, t)| t.address.display().to_string()).collect()
    }

    #[test]
    fn strip_common_prefix_strips_the_shared_directories() {
        let out = targets(strip_common_prefix().apply(stream(&["/a/b/c", "/a/b/d", "/a/e/f"])));
        assert_eq!(out, vec!["/b/c", "/b/d", "/e/f"]);
    }

    #[test]
    fn strip_common_prefix_keeps_a_lone_file_name() {
        let out = targets(strip_common_prefix().apply(stream(&["/lustre/a/b.dat"])));
        assert_eq!(out, vec!["/b.dat"]);
    }

    #[test]
    fn strip_common_prefix_of_nothing_is_nothing() {
        assert!(targets(strip_common_prefix().apply(stream(&[]))).is_empty());
    }

    #[test]
    fn strip_does_not_touch_sources() {
        let out: Vec<_> = strip_common_prefix()
            .apply(stream(&["/a/b/c", "/a/b/d"]))
            .map(|(s, _)| s.address.display().to_string())
            .collect();
        assert_eq!(out, vec!["/a/b/c", "/a/b/d"]);
    }

    #[test]
    fn prefix_prepends_to_rooted_targets() {
        let out = targets(prefix("/irods/base").apply(stream(&["/b/c", "/d"])));
        assert_eq!(out, vec!["/irods/base/b/c", "/irods/base/d"]);
    }

    #[test]
    #[should_panic]
    fn prefix_rejects_relative_paths() {
        prefix("relative/path");
    }

    #[test]
    fn last_n_keeps_the_tail() {
        let out = targets(last_n_components(2).apply(stream(&["/a/b/c/d", "/x"])));
        assert_eq!(out, vec!["/c/d", "/x"]);
    }

    #[test]
    fn percent_encoding_uses_the_safe_set() {
        let out = targets(percent_encode().apply(stream(&["/a b/c*d", "/plain-_#.txt"])));
        assert_eq!(out, vec!["/a%20b/c%2Ad", "/plain-_#.txt"]);
    }

    #[test]
    fn character_translate_rewrites_every_component() {
        let out = targets(character_translate(" ", "_", false).apply(stream(&["/a b/c d"])));
        assert_eq!(out, vec!["/a_b/c_d"]);
    }

    #[test]
    fn character_translate_name_only_leaves_directories() {
        let out = targets(character_translate(" ", "_", true).apply(stream(&["/a b/c d"])));
        assert_eq!(out, vec!["/a b/c_d"]);
    }

    #[test]
    fn telemetry_threads_the_exit_status() {
        let wrapped = telemetry().apply("exit 3");
        assert!(wrapped.contains("exit 3"));
        assert!(wrapped.contains("exit \"${exit_status}\""));
        assert!(!wrapped.contains("[[ script ]]"));
    }

    #[test]
    fn debugging_enables_tracing() {
        let wrapped = debugging().apply("do_copy");
        assert!(wrapped.contains("set -x"));
        assert!(wrapped.contains("do_copy"));
    }
}
