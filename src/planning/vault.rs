//! Vault address rewriting.
//!
//! Vault-internal source addresses encode their canonical name in a
//! base64-ish tail (`+_` standing in for the standard `+/`), fragmented into
//! two-character directory fans under `.vault/.staged` or `.vault/.stashed`.
//! This transformer decodes that tail and rebuilds the canonical target under
//! `/humgen`, deriving the owning group from the POSIX group of the enclosing
//! directory (optionally remapped through a group→team table). Addresses that
//! do not parse as Vault paths are logged and dropped from the stream.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use base64::Engine;
use base64::alphabet::Alphabet;
use base64::engine::general_purpose::GeneralPurposeConfig;
use base64::engine::{DecodePaddingMode, GeneralPurpose};
use regex::Regex;

use crate::filesystem::Data;
use crate::planning::transform::{IoStream, IoTransformer};

const LUSTRE_ROOT: &str = "/lustre/scratch";

const HUMGEN_ROOT: &str = "/humgen";

fn vault_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^
            (?P<prefix>                         # full group directory
              .*?/
              (?P<type> [^/]+ )/                # the 'type' directory
              (?P<group> [^/]+ )                # the group directory
            )/
            \.vault/                            # the vault directory
            (?P<branch> \.stashed | \.staged )  # the vault branch
            (?:/[0-9a-f]{2})*/[0-9a-f]{2}       # the encoded inode fan
            -                                   # delimiter
            (?P<encoded> [A-Za-z0-9+_/]+={0,2} )  # the base64(ish) encoded path
            $",
        )
        .expect("vault pattern is valid")
    })
}

/// Decode a Vault tail: slashes are fragmentation artefacts, and the alphabet
/// uses `+_` in place of the standard `+/`.
pub fn decode_vault_name(encoded: &str) -> Option<String> {
    static ENGINE: OnceLock<GeneralPurpose> = OnceLock::new();
    let engine = ENGINE.get_or_init(|| {
        let alphabet = Alphabet::new(
            "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+_",
        )
        .expect("vault alphabet is valid");
        GeneralPurpose::new(
            &alphabet,
            GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
        )
    });

    let compact: String = encoded.chars().filter(|&c| c != '/').collect();
    let decoded = engine.decode(compact).ok()?;
    String::from_utf8(decoded).ok()
}

/// Resolve the POSIX group name owning a directory.
pub type GroupResolver = Arc<dyn Fn(&Path) -> Option<String> + Send + Sync>;

#[cfg(unix)]
fn posix_group_owner(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;

    let gid = std::fs::metadata(path).ok()?.gid();

    let mut buffer = vec![0u8; 4096];
    let mut group: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();

    let status = unsafe {
        libc::getgrgid_r(
            gid,
            &mut group,
            buffer.as_mut_ptr() as *mut libc::c_char,
            buffer.len(),
            &mut result,
        )
    };

    if status != 0 || result.is_null() {
        return None;
    }

    let name = unsafe { std::ffi::CStr::from_ptr(group.gr_name) };
    name.to_str().ok().map(|s| s.to_string())
}

#[cfg(not(unix))]
fn posix_group_owner(_path: &Path) -> Option<String> {
    None
}

/// Group→team mapping, keyed by POSIX group name.
pub type TeamMapping = HashMap<String, String>;

/// Load a group→team mapping from a JSON object of strings.
pub fn load_team_mapping(path: &Path) -> anyhow::Result<TeamMapping> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Vault transformer using the real POSIX group lookup.
pub fn vault_transformer(teams: TeamMapping) -> IoTransformer {
    vault_transformer_with(Arc::new(posix_group_owner), teams)
}

/// Vault transformer with an injected group resolver.
pub fn vault_transformer_with(resolver: GroupResolver, teams: TeamMapping) -> IoTransformer {
    let rewrite = move |source: &Data| -> Option<PathBuf> {
        let address = source.address.to_string_lossy();

        if !address.starts_with(LUSTRE_ROOT) {
            return None;
        }
        let captures = vault_pattern().captures(&address)?;

        // The group type is either "projects" or "teams"
        let group_type = if &captures["type"] == "projects" {
            "projects"
        } else {
            "teams"
        };

        // The group is the team mapped from the group directory's POSIX
        // group owner, falling back to the name of the directory
        let group_path = Path::new(&captures["prefix"]);
        let group = resolver(group_path)
            .and_then(|owner| teams.get(&owner).cloned())
            .unwrap_or_else(|| captures["group"].to_string());

        // The Lustre volume is the second component of the source address
        let volume = source.address.components().nth(2)?.as_os_str().to_owned();

        let decoded = decode_vault_name(&captures["encoded"])?;

        let mut canonical = PathBuf::from(HUMGEN_ROOT);
        canonical.push(group_type);
        canonical.push(group);
        if &captures["branch"] == ".stashed" {
            canonical.push("stashed");
        }
        canonical.push(volume);
        canonical.push(decoded);

        log::debug!(
            "Vault address {} maps to {}",
            source.address.display(),
            canonical.display()
        );
        Some(canonical)
    };

    IoTransformer::new(crate::planning::graph::ON, move |io: IoStream| {
        let rewrite = rewrite.clone();
        Box::new(io.filter_map(move |(source, target)| match rewrite(&source) {
            Some(address) => Some((
                source,
                Data {
                    filesystem: target.filesystem,
                    address,
                },
            )),
            None => {
                log::error!(
                    "{} is not recognised as a Vault path",
                    source.address.display()
                );
                None
            }
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::mock_data;

    // base64("foo/bar/quux") in the Vault alphabet
    const ENCODED: &str = "Zm9vL2Jhci9xdXV4";

    fn transform(resolver_group: &str, teams: TeamMapping, source: &str) -> Vec<String> {
        let group = resolver_group.to_string();
        let resolver: GroupResolver = Arc::new(move |_| Some(group.clone()));
        let transformer = vault_transformer_with(resolver, teams);

        let pairs: IoStream = Box::new(std::iter::once((
            mock_data("Lustre", source),
            mock_data("iRODS", source),
        )));

        transformer
            .apply(pairs)
            .map(|(_, t)| t.address.display().to_string())
            .collect()
    }

    fn hgi_teams() -> TeamMapping {
        TeamMapping::from([("hgi".to_string(), "hgi".to_string())])
    }

    #[test]
    fn decodes_the_vault_alphabet() {
        assert_eq!(decode_vault_name(ENCODED).unwrap(), "foo/bar/quux");
    }

    #[test]
    fn decode_strips_fragmentation_slashes() {
        assert_eq!(decode_vault_name("Zm9v/L2Jh/ci9x/dXV4").unwrap(), "foo/bar/quux");
    }

    #[test]
    fn decode_handles_the_substituted_alphabet() {
        // '_' stands in for '/': 0xff 0xff decodes via "__8="
        assert_eq!(
            decode_vault_name("__8=").unwrap().as_bytes(),
            &[0xff, 0xff]
        );
    }

    #[test]
    fn staged_project_addresses_are_canonicalised() {
        let out = transform(
            "my_project",
            TeamMapping::new(),
            &format!(
                "/lustre/scratch101/projects/my_project/.vault/.staged/01/23/45/67/89/ab-{ENCODED}"
            ),
        );
        assert_eq!(out, vec!["/humgen/projects/my_project/scratch101/foo/bar/quux"]);
    }

    #[test]
    fn realdata_prefixes_still_parse() {
        let out = transform(
            "my_project",
            TeamMapping::new(),
            &format!(
                "/lustre/scratch101/realdata/mdt0/projects/my_project/.vault/.staged/01/23/45/67/89/ab-{ENCODED}"
            ),
        );
        assert_eq!(out, vec!["/humgen/projects/my_project/scratch101/foo/bar/quux"]);
    }

    #[test]
    fn stashed_addresses_gain_the_stashed_branch() {
        let out = transform(
            "my_project",
            TeamMapping::new(),
            &format!(
                "/lustre/scratch101/projects/my_project/.vault/.stashed/01/23/45/67/89/ab-{ENCODED}"
            ),
        );
        assert_eq!(
            out,
            vec!["/humgen/projects/my_project/stashed/scratch101/foo/bar/quux"]
        );
    }

    #[test]
    fn team_addresses_are_canonicalised() {
        let out = transform(
            "my_team",
            TeamMapping::new(),
            &format!("/lustre/scratch101/teams/my_team/.vault/.staged/01/23-{ENCODED}"),
        );
        assert_eq!(out, vec!["/humgen/teams/my_team/scratch101/foo/bar/quux"]);
    }

    #[test]
    fn non_project_types_become_teams() {
        // A vault directly under the volume root: "lustre"/"scratch101" play
        // the type/group roles and the POSIX owner mapping supplies the team
        let out = transform(
            "hgi",
            hgi_teams(),
            &format!("/lustre/scratch101/.vault/.staged/01/23/45/67/89/ab-{ENCODED}"),
        );
        assert_eq!(out, vec!["/humgen/teams/hgi/scratch101/foo/bar/quux"]);
    }

    #[test]
    fn stashed_team_fallback_addresses() {
        let out = transform(
            "hgi",
            hgi_teams(),
            &format!("/lustre/scratch101/realdata/mdt0/.vault/.stashed/01/23-{ENCODED}"),
        );
        assert_eq!(out, vec!["/humgen/teams/hgi/stashed/scratch101/foo/bar/quux"]);
    }

    #[test]
    fn non_vault_addresses_are_dropped() {
        let out = transform("g", TeamMapping::new(), "/lustre/scratch101/ordinary/file.txt");
        assert!(out.is_empty());
    }

    #[test]
    fn addresses_outside_the_lustre_root_are_dropped() {
        let out = transform(
            "g",
            TeamMapping::new(),
            &format!("/nfs/scratch101/projects/p/.vault/.staged/01-{ENCODED}"),
        );
        assert!(out.is_empty());
    }
}
