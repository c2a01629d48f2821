//! Level-by-level recursive listing shared by the directory based adapters

use crate::client::{ListOptions, RemoteDataClient};
use crate::path;
use std::collections::VecDeque;
use transfers_types::{FileInfo, Result};

/// Walk `root` breadth first, one directory level per backend call.
///
/// Stops early once enough entries for `offset + limit` were collected so an
/// oversized tree is never fully materialised.
pub async fn walk<C>(client: &C, root: &str, options: &ListOptions) -> Result<Vec<FileInfo>>
where
    C: RemoteDataClient + ?Sized,
{
    let level = options.level();
    let max_depth = options.max_depth.unwrap_or(usize::MAX).max(1);
    let wanted = options.limit.map(|limit| limit.saturating_add(options.offset));
    let root_relative = path::normalize(root)?;

    let mut collected = Vec::new();
    let mut pending = VecDeque::from([(root_relative, 1usize)]);

    while let Some((dir, depth)) = pending.pop_front() {
        for entry in client.list(&dir, &level).await? {
            // Listing a file yields the file itself.
            let is_self = entry.path == dir;
            if entry.is_dir && !is_self && depth < max_depth {
                pending.push_back((entry.path.clone(), depth + 1));
            }
            let keep = options
                .filter
                .as_deref()
                .map_or(true, |pattern| crate::glob::wildcard_match(pattern, &entry.name));
            if keep && !(is_self && entry.is_dir) {
                collected.push(entry);
            }
            if wanted.is_some_and(|wanted| collected.len() >= wanted) {
                pending.clear();
                break;
            }
        }
    }

    let paged = collected.into_iter().skip(options.offset);
    Ok(match options.limit {
        Some(limit) => paged.take(limit).collect(),
        None => paged.collect(),
    })
}
