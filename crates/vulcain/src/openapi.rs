// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`RouteLookup`] backed by the links of an OpenAPI 3 document, in JSON or YAML.
//!
//! Given this description:
//!
//! ```json
//! {"paths": {
//!   "/books/{id}": {"get": {"responses": {"200": {"links": {"author": {
//!     "operationId": "getUser",
//!     "parameters": {"id": "$response.body#/author"}
//!   }}}}}},
//!   "/users/{id}": {"get": {"operationId": "getUser"}}
//! }}
//! ```
//!
//! the value `5` found at `/author` in a response of `/books/1` designates `/users/5`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use http::Uri;
use serde::Deserialize;
use tracing::debug;

use crate::route::{RouteContext, RouteLookup};

#[derive(Debug, thiserror::Error)]
pub enum OpenApiError {
    #[error("could not read OpenAPI description {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid OpenAPI description: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid OpenAPI description: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    paths: BTreeMap<String, PathItem>,
}

#[derive(Debug, Default, Deserialize)]
struct PathItem {
    get: Option<Operation>,
    put: Option<Operation>,
    post: Option<Operation>,
    delete: Option<Operation>,
    options: Option<Operation>,
    head: Option<Operation>,
    patch: Option<Operation>,
    trace: Option<Operation>,
}

impl PathItem {
    fn operations(&self) -> impl Iterator<Item = &Operation> {
        [
            &self.get,
            &self.put,
            &self.post,
            &self.delete,
            &self.options,
            &self.head,
            &self.patch,
            &self.trace,
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(rename = "operationId")]
    operation_id: Option<String>,
    #[serde(default)]
    responses: BTreeMap<String, Response>,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    links: BTreeMap<String, Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(rename = "operationId")]
    operation_id: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, serde_json::Value>,
}

/// OpenAPI description used to synthesize relations for non-hypermedia APIs.
#[derive(Debug)]
pub struct OpenApi {
    document: Document,
}

impl OpenApi {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, OpenApiError> {
        let path = path.as_ref();
        let contents = std::fs::read(path).map_err(|source| OpenApiError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_slice(&contents)
    }

    /// Parses a description, as JSON when it starts with `{` and as YAML otherwise.
    pub fn from_slice(contents: &[u8]) -> Result<Self, OpenApiError> {
        let is_json = contents
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|&b| b == b'{');
        let document = if is_json {
            serde_json::from_slice(contents)?
        } else {
            serde_yaml::from_slice(contents)?
        };
        Ok(Self { document })
    }

    fn template_for_operation(&self, operation_id: &str) -> Option<&str> {
        self.document
            .paths
            .iter()
            .find(|(_, item)| {
                item.operations()
                    .any(|op| op.operation_id.as_deref() == Some(operation_id))
            })
            .map(|(template, _)| template.as_str())
    }
}

/// Number of templated segments if `template` matches `path`.
fn match_template(template: &str, path: &str) -> Option<usize> {
    let mut template_segments = template.split('/');
    let mut path_segments = path.split('/');
    let mut parameters = 0;
    loop {
        match (template_segments.next(), path_segments.next()) {
            (None, None) => return Some(parameters),
            (Some(t), Some(p)) if t.starts_with('{') && t.ends_with('}') => {
                if p.is_empty() {
                    return None;
                }
                parameters += 1;
            }
            (Some(t), Some(p)) if t == p => {}
            _ => return None,
        }
    }
}

impl RouteLookup for OpenApi {
    fn resolve_route(&self, uri: &Uri) -> Option<RouteContext> {
        let route = self
            .document
            .paths
            .iter()
            .filter(|(_, item)| item.get.is_some())
            .filter_map(|(template, _)| {
                match_template(template, uri.path()).map(|params| (params, template))
            })
            .min_by_key(|(params, _)| *params)
            .map(|(_, template)| RouteContext::new(template.as_str()));
        if route.is_none() {
            debug!("No OpenAPI route matches {}", uri.path());
        }
        route
    }

    fn resolve_relation(&self, route: &RouteContext, selector: &str, raw: &str) -> Option<String> {
        let operation = self.document.paths.get(route.id())?.get.as_ref()?;
        let expression = format!("$response.body#{selector}");

        for link in operation.responses.values().flat_map(|r| r.links.values()) {
            let Some(parameter) = link
                .parameters
                .iter()
                .find(|(_, value)| value.as_str() == Some(expression.as_str()))
                .map(|(name, _)| name)
            else {
                continue;
            };
            let Some(template) = link
                .operation_id
                .as_deref()
                .and_then(|id| self.template_for_operation(id))
            else {
                debug!("OpenAPI link for {selector} targets an unknown operation");
                continue;
            };

            let relation = template.replace(&format!("{{{parameter}}}"), raw);
            if relation.contains('{') {
                debug!("OpenAPI link for {selector} leaves parameters unresolved: {relation}");
                continue;
            }
            return Some(relation);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    const DESCRIPTION: &str = r##"{
        "openapi": "3.0.0",
        "paths": {
            "/books": {"get": {"operationId": "getBooks"}},
            "/books/{id}": {
                "parameters": [{"name": "id", "in": "path"}],
                "get": {
                    "operationId": "getBook",
                    "responses": {
                        "200": {
                            "description": "A book",
                            "links": {
                                "author": {
                                    "operationId": "getUser",
                                    "parameters": {"userId": "$response.body#/author"}
                                },
                                "reviews": {
                                    "operationId": "getReview",
                                    "parameters": {"reviewId": "$response.body#/reviews/*"}
                                },
                                "broken": {
                                    "operationId": "getComment",
                                    "parameters": {"commentId": "$response.body#/comment"}
                                }
                            }
                        },
                        "404": {"$ref": "#/components/responses/NotFound"}
                    }
                }
            },
            "/books/latest": {"get": {"operationId": "getLatestBook"}},
            "/users/{userId}": {"get": {"operationId": "getUser"}},
            "/reviews/{reviewId}": {"get": {"operationId": "getReview"}},
            "/books/{id}/comments/{commentId}": {"get": {"operationId": "getComment"}},
            "/uploads/{id}": {"post": {"operationId": "upload"}}
        }
    }"##;

    fn route(openapi: &OpenApi, path: &'static str) -> Option<String> {
        openapi
            .resolve_route(&Uri::from_static(path))
            .map(|route| route.id().to_owned())
    }

    #[test]
    fn matches_routes() {
        let openapi = OpenApi::from_slice(DESCRIPTION.as_bytes()).unwrap();
        assert_eq!(route(&openapi, "/books/1").as_deref(), Some("/books/{id}"));
        assert_eq!(
            route(&openapi, "/books/latest").as_deref(),
            Some("/books/latest")
        );
        assert_eq!(route(&openapi, "/books").as_deref(), Some("/books"));
        assert_eq!(route(&openapi, "/books/").as_deref(), None);
        assert_eq!(route(&openapi, "/uploads/1").as_deref(), None);
        assert_eq!(route(&openapi, "/unknown").as_deref(), None);
    }

    #[test]
    fn builds_relations_from_links() {
        let openapi = OpenApi::from_slice(DESCRIPTION.as_bytes()).unwrap();
        let book = RouteContext::new("/books/{id}");
        assert_eq!(
            openapi.resolve_relation(&book, "/author", "5").as_deref(),
            Some("/users/5")
        );
        assert_eq!(
            openapi.resolve_relation(&book, "/reviews/*", "7").as_deref(),
            Some("/reviews/7")
        );
        assert_eq!(openapi.resolve_relation(&book, "/comment", "3"), None);
        assert_eq!(openapi.resolve_relation(&book, "/title", "t"), None);

        let users = RouteContext::new("/users/{userId}");
        assert_eq!(openapi.resolve_relation(&users, "/author", "5"), None);
    }

    #[test]
    fn reads_description_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DESCRIPTION.as_bytes()).unwrap();
        let openapi = OpenApi::from_path(file.path()).unwrap();
        assert_eq!(route(&openapi, "/users/9").as_deref(), Some("/users/{userId}"));

        assert!(matches!(
            OpenApi::from_path(file.path().with_extension("missing")),
            Err(OpenApiError::Read { .. })
        ));
        assert!(matches!(
            OpenApi::from_slice(b"{\"paths\": "),
            Err(OpenApiError::Parse(_))
        ));
        assert!(matches!(
            OpenApi::from_slice(b"paths: [unclosed"),
            Err(OpenApiError::ParseYaml(_))
        ));
    }

    const YAML_DESCRIPTION: &str = r#"
openapi: 3.0.0
paths:
  /books/{id}:
    get:
      operationId: getBook
      responses:
        "200":
          description: A book
          links:
            author:
              operationId: getUser
              parameters:
                userId: "$response.body#/author"
  /users/{userId}:
    get:
      operationId: getUser
"#;

    #[test]
    fn reads_yaml_descriptions() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(YAML_DESCRIPTION.as_bytes()).unwrap();
        let openapi = OpenApi::from_path(file.path()).unwrap();
        assert_eq!(route(&openapi, "/books/2").as_deref(), Some("/books/{id}"));
        let book = RouteContext::new("/books/{id}");
        assert_eq!(
            openapi.resolve_relation(&book, "/author", "5").as_deref(),
            Some("/users/5")
        );
    }
}
