// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Locating `services.json` files beneath input directories. */

use {
    crate::{
        error::Result,
        manifest::{ServiceDescriptor, SERVICES_FILENAME},
    },
    log::debug,
    std::path::{Path, PathBuf},
};

/// How many directory levels below an input directory are searched.
pub const SERVICE_SEARCH_DEPTH: usize = 3;

/// Find directories containing `services.json` at most `max_depth` levels below `root`.
///
/// `root` itself is depth 0. Symlinks are not followed. Results are in
/// depth-first walk order.
pub fn find_service_dirs(root: &Path, max_depth: usize) -> Result<Vec<PathBuf>> {
    let mut dirs = vec![];

    let walker = walkdir::WalkDir::new(root)
        .max_depth(max_depth + 1)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()));

    for entry in walker {
        let entry = entry?;

        if entry.file_type().is_file() && entry.file_name() == SERVICES_FILENAME {
            if let Some(parent) = entry.path().parent() {
                debug!("found service in {}", parent.display());
                dirs.push(parent.to_path_buf());
            }
        }
    }

    Ok(dirs)
}

/// Discover and load every service under `roots`.
///
/// Invalid descriptors are returned with `valid == false` so callers can
/// skip them. A directory reached from several roots is loaded once.
pub fn discover_services(roots: &[PathBuf], max_depth: usize) -> Result<Vec<ServiceDescriptor>> {
    let mut seen = std::collections::BTreeSet::new();
    let mut services = vec![];

    for root in roots {
        for dir in find_service_dirs(root, max_depth)? {
            if seen.insert(dir.clone()) {
                services.push(ServiceDescriptor::load(&dir)?);
            }
        }
    }

    Ok(services)
}
