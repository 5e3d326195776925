//! Seams between the refresh pipeline and the two external services.

use async_trait::async_trait;
use futures::stream::{self, Stream};

use super::raw::{MetadataId, RawDetails, RawListing, RawPlatform, ReferenceData};
use super::model::AvailabilityKind;
use crate::error::SourceError;

/// Explicit pagination cursor. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub page: u32,
}

impl PageCursor {
    pub fn first() -> Self {
        Self { page: 1 }
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor of the following page; `None` once the listing is exhausted.
    pub next: Option<PageCursor>,
}

/// What to list from the availability source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    pub region: String,
    pub kind: AvailabilityKind,
}

#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Platforms offering titles for the given region/type.
    async fn platforms(&self, query: &CatalogQuery) -> Result<Vec<RawPlatform>, SourceError>;

    /// One page of a platform's catalog.
    async fn listing_page(
        &self,
        platform: &RawPlatform,
        cursor: PageCursor,
    ) -> Result<Page<RawListing>, SourceError>;
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reference_data(&self) -> Result<ReferenceData, SourceError>;

    async fn details(&self, id: MetadataId) -> Result<RawDetails, SourceError>;
}

/// Lazily walks a platform's catalog page by page. The stream yields every
/// listing and ends after the last page or the first error.
pub fn listing_stream<'a, S>(
    source: &'a S,
    platform: &'a RawPlatform,
) -> impl Stream<Item = Result<RawListing, SourceError>> + 'a
where
    S: AvailabilitySource + ?Sized,
{
    use futures::StreamExt;

    stream::try_unfold(Some(PageCursor::first()), move |cursor| async move {
        let Some(cursor) = cursor else {
            return Ok(None);
        };
        let page = source.listing_page(platform, cursor).await?;
        let items = stream::iter(page.items.into_iter().map(Ok::<_, SourceError>));
        Ok(Some((items, page.next)))
    })
    .map(|chunk| match chunk {
        Ok(items) => items.left_stream(),
        Err(err) => stream::iter(vec![Err(err)]).right_stream(),
    })
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::TryStreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct PagedSource {
        pages: u32,
        fail_on: Option<u32>,
        calls: AtomicU32,
    }

    fn listing(id: i64, platform: &RawPlatform) -> RawListing {
        RawListing {
            watchmode_id: id,
            title: format!("Title {id}"),
            year: Some(2000 + id as i32),
            imdb_id: None,
            tmdb_id: None,
            media_kind: None,
            platform_id: platform.id,
            platform: platform.name.clone(),
            region: platform.region.clone(),
            kind: platform.kind,
            observed_at: Utc::now(),
        }
    }

    #[async_trait]
    impl AvailabilitySource for PagedSource {
        fn name(&self) -> &'static str {
            "paged"
        }

        async fn platforms(&self, _query: &CatalogQuery) -> Result<Vec<RawPlatform>, SourceError> {
            Ok(Vec::new())
        }

        async fn listing_page(
            &self,
            platform: &RawPlatform,
            cursor: PageCursor,
        ) -> Result<Page<RawListing>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(cursor.page) {
                return Err(SourceError::SourceUnavailable {
                    provider: "paged",
                    status: Some(503),
                    message: "down".into(),
                });
            }
            let base = (cursor.page as i64 - 1) * 2;
            let next = (cursor.page < self.pages).then(|| PageCursor {
                page: cursor.page + 1,
            });
            Ok(Page {
                items: vec![listing(base + 1, platform), listing(base + 2, platform)],
                next,
            })
        }
    }

    fn platform() -> RawPlatform {
        RawPlatform {
            id: 203,
            name: "Netflix".into(),
            region: "US".into(),
            kind: AvailabilityKind::Subscription,
        }
    }

    #[tokio::test]
    async fn walks_every_page_in_order() {
        let source = PagedSource {
            pages: 3,
            fail_on: None,
            calls: AtomicU32::new(0),
        };
        let platform = platform();
        let items: Vec<RawListing> = listing_stream(&source, &platform)
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<i64> = items.iter().map(|l| l.watchmode_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_first_failed_page() {
        let source = PagedSource {
            pages: 5,
            fail_on: Some(2),
            calls: AtomicU32::new(0),
        };
        let platform = platform();
        let result: Result<Vec<RawListing>, SourceError> =
            listing_stream(&source, &platform).try_collect().await;
        assert!(matches!(
            result,
            Err(SourceError::SourceUnavailable { status: Some(503), .. })
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stream_is_lazy() {
        let source = PagedSource {
            pages: 4,
            fail_on: None,
            calls: AtomicU32::new(0),
        };
        let platform = platform();
        let _stream = listing_stream(&source, &platform);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
