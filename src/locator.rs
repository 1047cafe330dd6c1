//! Paginated lookup of dospin-managed remote resources
//!
//! Every droplet and snapshot dospin creates is named `dospin-<server>`, so
//! lookups page through the account's collection at a fixed page size until
//! the namespaced name turns up or a short page marks the end.

use crate::api::{ApiResult, ComputeApi, Droplet, Image, Page, SshKey};
use crate::error::{ComputeError, ResourceKind};
use std::future::Future;

/// Prefix applied to every remote resource dospin owns
pub const NAMESPACE: &str = "dospin-";

/// Entries requested per page
pub const PAGE_SIZE: u32 = 200;

pub fn namespaced(name: &str) -> String {
    format!("{NAMESPACE}{name}")
}

/// Page through a collection until `matches` accepts an entry.
///
/// Returns `Ok(None)` once a page comes back shorter than `per_page`. An
/// error fetching any page is returned as-is: callers must not mistake an
/// unreachable API for an absent resource.
pub async fn find_paged<T, F, Fut, M>(per_page: u32, mut fetch: F, mut matches: M) -> ApiResult<Option<T>>
where
    F: FnMut(Page) -> Fut,
    Fut: Future<Output = ApiResult<Vec<T>>>,
    M: FnMut(&T) -> bool,
{
    let per_page = per_page.max(1);
    let mut page = Page::first(per_page);
    loop {
        let items = fetch(page).await?;
        let short = items.len() < per_page as usize;
        if let Some(found) = items.into_iter().find(|item| matches(item)) {
            return Ok(Some(found));
        }
        if short {
            return Ok(None);
        }
        page = page.next();
    }
}

/// Page through a whole collection, keeping every entry `matches` accepts.
pub async fn collect_paged<T, F, Fut, M>(per_page: u32, mut fetch: F, mut matches: M) -> ApiResult<Vec<T>>
where
    F: FnMut(Page) -> Fut,
    Fut: Future<Output = ApiResult<Vec<T>>>,
    M: FnMut(&T) -> bool,
{
    let per_page = per_page.max(1);
    let mut page = Page::first(per_page);
    let mut found = Vec::new();
    loop {
        let items = fetch(page).await?;
        let short = items.len() < per_page as usize;
        found.extend(items.into_iter().filter(|item| matches(item)));
        if short {
            return Ok(found);
        }
        page = page.next();
    }
}

/// Find the droplet backing logical server `name`.
pub async fn find_droplet(api: &dyn ComputeApi, name: &str) -> Result<Droplet, ComputeError> {
    let full_name = namespaced(name);
    find_paged(PAGE_SIZE, |page| api.list_droplets(page), |d: &Droplet| d.name == full_name)
        .await?
        .ok_or(ComputeError::NotFound {
            kind: ResourceKind::Droplet,
            name: full_name,
        })
}

/// Find the most recent snapshot image saved for logical server `name`.
pub async fn find_snapshot(api: &dyn ComputeApi, name: &str) -> Result<Image, ComputeError> {
    let full_name = namespaced(name);
    let snapshots = collect_paged(PAGE_SIZE, |page| api.list_snapshots(page), |i: &Image| {
        i.name == full_name
    })
    .await?;

    // max_by keeps the last of equal elements, so later listings win ties
    snapshots
        .into_iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at))
        .ok_or(ComputeError::NotFound {
            kind: ResourceKind::Snapshot,
            name: full_name,
        })
}

/// Resolve registered SSH key names to fingerprints, in the order given.
pub async fn find_ssh_key_fingerprints(
    api: &dyn ComputeApi,
    names: &[String],
) -> Result<Vec<String>, ComputeError> {
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let keys = collect_paged(PAGE_SIZE, |page| api.list_ssh_keys(page), |k: &SshKey| {
        names.contains(&k.name)
    })
    .await?;

    names
        .iter()
        .map(|name| {
            keys.iter()
                .find(|k| &k.name == name)
                .map(|k| k.fingerprint.clone())
                .ok_or_else(|| ComputeError::NotFound {
                    kind: ResourceKind::SshKey,
                    name: name.clone(),
                })
        })
        .collect()
}
