//! Populates stores from paginated remote searches.

use crate::{
    client::{ApiError, PolicyClient},
    error::Error,
    index::{PolicyStores, Store, StoredResource},
    tags,
};
use serde::de::DeserializeOwned;

/// The page size requested first.
pub const PAGE_SIZE: i64 = 1000;

/// How much the page size shrinks after a page-too-large response.
const PAGE_SIZE_STEP: i64 = 100;

/// The smallest page size requested.
pub const MIN_PAGE_SIZE: i64 = 10;

/// Builds a query matching objects of `resource_type` created in `cluster`
/// and owned by a resource tagged with `owner_scope`.
pub fn query(resource_type: &str, cluster: &str, owner_scope: &str) -> String {
    format!(
        "resource_type:{resource_type} AND tags.scope:{} AND tags.tag:{} AND tags.scope:{}",
        escape(tags::SCOPE_CLUSTER),
        escape(cluster),
        escape(owner_scope),
    )
}

// The search syntax treats `/` as a regex delimiter.
fn escape(term: &str) -> String {
    term.replace('/', "\\/")
}

/// Fetches every result of `query`, following cursors.
///
/// The page size starts at [`PAGE_SIZE`] and shrinks by a fixed step each
/// time the remote rejects it, down to [`MIN_PAGE_SIZE`]. The same cursor is
/// retried after shrinking.
pub async fn search_all<C>(client: &C, query: &str) -> Result<Vec<serde_json::Value>, Error>
where
    C: PolicyClient + ?Sized,
{
    let mut results = Vec::new();
    let mut cursor: Option<String> = None;
    let mut page_size = PAGE_SIZE;
    loop {
        let page = match client.search(query, cursor.as_deref(), page_size).await {
            Ok(page) => page,
            Err(ApiError::PageTooLarge { .. }) if page_size > MIN_PAGE_SIZE => {
                let smaller = (page_size - PAGE_SIZE_STEP).max(MIN_PAGE_SIZE);
                tracing::info!(page_size, smaller, "page size too large, retrying");
                page_size = smaller;
                continue;
            }
            Err(ApiError::PageTooLarge { .. }) => {
                return Err(ApiError::PageTooLarge { page_size }.into())
            }
            Err(error) => return Err(error.into()),
        };

        let result_count = page.result_count;
        results.extend(page.results);
        let next = match page.cursor {
            Some(next) => next,
            None => break,
        };
        if next.parse::<i64>().map_or(false, |offset| offset >= result_count) {
            break;
        }
        cursor = Some(next);
    }
    tracing::debug!(%query, results = results.len(), "search complete");
    Ok(results)
}

/// Loads every result of `query` into `store`, returning the number loaded.
pub async fn populate<C, T>(client: &C, store: &Store<T>, query: &str) -> Result<usize, Error>
where
    C: PolicyClient + ?Sized,
    T: StoredResource + DeserializeOwned,
{
    let results = search_all(client, query).await?;
    let count = results.len();
    for value in results {
        let obj = serde_json::from_value::<T>(value).map_err(|source| Error::Decode {
            kind: T::KIND,
            source,
        })?;
        store.apply(obj);
    }
    tracing::info!(kind = T::KIND, count, "populated store");
    Ok(count)
}

/// Loads every group, policy and rule owned by this cluster.
///
/// The three searches run concurrently and the first failure is returned.
pub async fn initialize<C>(client: &C, cluster: &str, stores: &PolicyStores) -> Result<(), Error>
where
    C: PolicyClient + ?Sized,
{
    let groups = query("Group", cluster, tags::SCOPE_CR_UID);
    let policies = query("SecurityPolicy", cluster, tags::SCOPE_CR_UID);
    let rules = query("Rule", cluster, tags::SCOPE_CR_UID);
    tokio::try_join!(
        populate(client, &stores.groups, &groups),
        populate(client, &stores.policies, &policies),
        populate(client, &stores.rules, &rules),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::SearchResponse, tests::FakeClient};
    use pretty_assertions::assert_eq;

    #[test]
    fn query_escapes_slashes() {
        assert_eq!(
            query("Group", "cl-1", tags::SCOPE_CR_UID),
            "resource_type:Group AND tags.scope:nsx-op\\/cluster AND tags.tag:cl-1 \
             AND tags.scope:nsx-op\\/security_policy_cr_uid"
        );
    }

    #[tokio::test]
    async fn shrinks_page_size_to_the_floor() {
        let client = FakeClient::default();
        client.reject_page_sizes_above(0);
        let err = search_all(&client, "q").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Api(ApiError::PageTooLarge { page_size: MIN_PAGE_SIZE })
        ));

        let mut expected = (1..=10).rev().map(|n| n * 100).collect::<Vec<i64>>();
        expected.push(MIN_PAGE_SIZE);
        assert_eq!(client.requested_page_sizes(), expected);
    }

    #[tokio::test]
    async fn one_failed_query_fails_initialize() {
        let client = FakeClient::default();
        client.set_results("Group", vec![]);
        client.set_results("SecurityPolicy", vec![]);
        client.fail_searches("Rule");

        let stores = PolicyStores::default();
        let err = initialize(&client, "test", &stores).await.unwrap_err();
        assert!(matches!(err, Error::Api(ApiError::Service { code: 500, .. })));
        assert!(stores.rules.is_empty());
    }

    #[tokio::test]
    async fn follows_cursors_with_the_reduced_page_size() {
        let client = FakeClient::default();
        client.reject_page_sizes_above(500);
        client.push_page(SearchResponse {
            results: vec![serde_json::json!({ "id": "a" })],
            cursor: Some("1".to_string()),
            result_count: 2,
        });
        client.push_page(SearchResponse {
            results: vec![serde_json::json!({ "id": "b" })],
            cursor: Some("2".to_string()),
            result_count: 2,
        });

        let results = search_all(&client, "q").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(
            client.requested_page_sizes(),
            vec![1000, 900, 800, 700, 600, 500, 500]
        );
        assert_eq!(
            client.requested_cursors(),
            vec![None, None, None, None, None, None, Some("1".to_string())]
        );
    }
}
