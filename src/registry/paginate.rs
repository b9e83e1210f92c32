//! Paginated list endpoints: catalog and tags
//!
//! The registry splits long lists across pages announced through
//! `Link: <...>; rel="next"` headers. Pages are drained with an explicit
//! loop before returning, concatenated in server-supplied order; the cursor
//! is only known from the prior response, so fetching is strictly
//! sequential.

use super::Registry;
use crate::error::Result;
use reqwest::header::HeaderMap;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Vec<String>,
}

impl Registry {
    /// Returns every repository in the registry, following pagination to the
    /// last page.
    pub async fn catalog(&self) -> Result<Vec<String>> {
        let mut repositories = Vec::new();
        let mut next = Some("/v2/_catalog".to_string());

        while let Some(cursor) = next {
            let url = self.page_url(&cursor);
            tracing::debug!(url, "fetching catalog page");
            let (page, headers): (CatalogResponse, HeaderMap) = self.get_json(&url, None).await?;
            repositories.extend(page.repositories);
            next = next_link(&headers);
        }

        Ok(repositories)
    }

    /// Returns the tags for a repository, following pagination to the last
    /// page.
    pub async fn tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut next = Some(format!("/v2/{}/tags/list", repository));

        while let Some(cursor) = next {
            let url = self.page_url(&cursor);
            tracing::debug!(url, repository, "fetching tags page");
            let (page, headers): (TagsResponse, HeaderMap) = self.get_json(&url, None).await?;
            tags.extend(page.tags);
            next = next_link(&headers);
        }

        Ok(tags)
    }

    fn page_url(&self, cursor: &str) -> String {
        if cursor.starts_with("http://") || cursor.starts_with("https://") {
            cursor.to_string()
        } else {
            self.endpoint(cursor)
        }
    }
}

/// Extracts the `rel="next"` target from a `Link` header, percent-decoded.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    for (uri, rel) in parse_link_header(value) {
        if rel == "next" {
            return Some(percent_decode(&uri));
        }
    }
    None
}

/// Parses a `Link` header value into `(uri, rel)` pairs.
fn parse_link_header(value: &str) -> Vec<(String, String)> {
    let mut links = Vec::new();
    let mut rest = value;

    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>') else { break };
        let uri = rest[start + 1..start + end].to_string();
        rest = &rest[start + end + 1..];

        // Parameters run up to the next link (or the end of the header).
        let params_end = rest.find('<').unwrap_or(rest.len());
        let params = &rest[..params_end];
        let rel = params
            .split(';')
            .filter_map(|p| p.trim().trim_end_matches(',').trim().split_once('='))
            .find(|(k, _)| k.trim() == "rel")
            .map(|(_, v)| v.trim().trim_matches('"').to_string())
            .unwrap_or_default();

        links.push((uri, rel));
        rest = &rest[params_end..];
    }

    links
}

/// Decodes percent-escapes in a continuation URL. Invalid escapes are left
/// untouched.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, LINK};

    fn headers_with_link(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LINK, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_next_link_single() {
        let headers = headers_with_link("</v2/_catalog?last=foo&n=100>; rel=\"next\"");
        assert_eq!(next_link(&headers).as_deref(), Some("/v2/_catalog?last=foo&n=100"));
    }

    #[test]
    fn test_next_link_among_multiple() {
        let headers = headers_with_link(
            "</v2/_catalog?last=a>; rel=\"prev\", </v2/_catalog?last=z&n=50>; rel=\"next\"",
        );
        assert_eq!(next_link(&headers).as_deref(), Some("/v2/_catalog?last=z&n=50"));
    }

    #[test]
    fn test_next_link_absent() {
        let headers = headers_with_link("</v2/_catalog?last=a>; rel=\"prev\"");
        assert!(next_link(&headers).is_none());
        assert!(next_link(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_next_link_percent_decoded() {
        let headers =
            headers_with_link("</v2/_catalog?last=foo%2Fbar&n=100>; rel=\"next\"");
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("/v2/_catalog?last=foo/bar&n=100")
        );
    }

    #[test]
    fn test_parse_link_header_pairs() {
        let links = parse_link_header("<a>; rel=\"next\", <b>; rel=\"prev\"");
        assert_eq!(
            links,
            vec![
                ("a".to_string(), "next".to_string()),
                ("b".to_string(), "prev".to_string())
            ]
        );
    }

    #[test]
    fn test_percent_decode_leaves_invalid_escapes() {
        assert_eq!(percent_decode("a%2Fb"), "a/b");
        assert_eq!(percent_decode("a%zzb"), "a%zzb");
        assert_eq!(percent_decode("plain"), "plain");
    }

    mod paged_registry {
        use crate::registry::{Registry, RegistryOptions};
        use axum::extract::RawQuery;
        use axum::response::IntoResponse;
        use std::future::IntoFuture;
        use std::net::SocketAddr;

        // Two-page registry: the first page of each listing carries a
        // rel="next" link, the second page carries none.
        async fn serve() -> SocketAddr {
            let app = axum::Router::new()
                .route(
                    "/v2/_catalog",
                    axum::routing::get(|RawQuery(query): RawQuery| async move {
                        if query.unwrap_or_default().contains("last=b") {
                            r#"{"repositories":["c"]}"#.into_response()
                        } else {
                            let mut headers = axum::http::HeaderMap::new();
                            headers.insert(
                                axum::http::header::LINK,
                                "</v2/_catalog?last=b&n=2>; rel=\"next\"".parse().unwrap(),
                            );
                            (headers, r#"{"repositories":["a","b"]}"#).into_response()
                        }
                    }),
                )
                .route(
                    "/v2/{repo}/tags/list",
                    axum::routing::get(|RawQuery(query): RawQuery| async move {
                        if query.unwrap_or_default().contains("last=v1") {
                            r#"{"tags":["v2"]}"#.into_response()
                        } else {
                            let mut headers = axum::http::HeaderMap::new();
                            headers.insert(
                                axum::http::header::LINK,
                                "</v2/htop/tags/list?last=v1&n=2>; rel=\"next\""
                                    .parse()
                                    .unwrap(),
                            );
                            (headers, r#"{"tags":["latest","v1"]}"#).into_response()
                        }
                    }),
                );

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(axum::serve(listener, app).into_future());
            addr
        }

        async fn registry_for(addr: SocketAddr) -> Registry {
            Registry::builder(format!("127.0.0.1:{}", addr.port()))
                .with_options(RegistryOptions {
                    non_ssl: true,
                    skip_ping: true,
                    ..Default::default()
                })
                .build()
                .await
                .unwrap()
        }

        #[tokio::test]
        async fn test_catalog_follows_next_links() {
            let registry = registry_for(serve().await).await;
            let repos = registry.catalog().await.unwrap();
            assert_eq!(repos, vec!["a", "b", "c"]);
        }

        #[tokio::test]
        async fn test_tags_follows_next_links() {
            let registry = registry_for(serve().await).await;
            let tags = registry.tags("htop").await.unwrap();
            assert_eq!(tags, vec!["latest", "v1", "v2"]);
        }
    }
}
