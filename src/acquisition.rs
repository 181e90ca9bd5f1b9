//! Image crawler for MediaWiki file categories
//!
//! Walks a category tree through the `categorymembers` list API, collecting
//! file pages (namespace 6) and descending into subcategories (namespace
//! 14). Each selected file is then resolved to its original URL through
//! `prop=imageinfo` and downloaded into the raw image directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::progress;

const FILE_NAMESPACE: i64 = 6;
const CATEGORY_NAMESPACE: i64 = 14;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionSummary {
    pub found: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
struct CategoryResponse {
    #[serde(default)]
    query: Option<CategoryQuery>,
    #[serde(rename = "continue", default)]
    continuation: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct CategoryQuery {
    #[serde(default)]
    categorymembers: Vec<CategoryMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct CategoryMember {
    ns: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ImageInfoResponse {
    #[serde(default)]
    query: Option<PagesQuery>,
}

#[derive(Debug, Deserialize)]
struct PagesQuery {
    #[serde(default)]
    pages: HashMap<String, Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    imageinfo: Vec<ImageInfo>,
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    url: String,
}

enum Fetched {
    Downloaded,
    AlreadyPresent,
}

pub struct DataAcquirer {
    client: reqwest::Client,
    api_url: String,
}

impl DataAcquirer {
    pub fn new(api_url: &str, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
        })
    }

    /// Download up to `limit` images from `start_category` and its subcategories
    pub async fn download_images_from_category(
        &self,
        start_category: &str,
        output_dir: &Path,
        limit: usize,
    ) -> Result<AcquisitionSummary> {
        info!(category = start_category, "Fetching list of all images in category tree");
        let titles = self.collect_file_titles(start_category).await;
        let selected = select_titles(titles, limit);

        let mut summary = AcquisitionSummary {
            found: selected.found,
            ..Default::default()
        };
        info!(unique = selected.found, "Found unique images");
        if selected.titles.is_empty() {
            warn!("No images found in the specified category tree.");
            return Ok(summary);
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let total = selected.titles.len();
        info!(count = total, "Attempting to download images");
        let pb = progress::bar(total, "Downloading");
        for (i, title) in selected.titles.iter().enumerate() {
            match self.download_image(title, output_dir).await {
                Ok(Fetched::Downloaded) => summary.downloaded += 1,
                Ok(Fetched::AlreadyPresent) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(title = %title, error = %format!("{e:#}"), "Failed to download image");
                }
            }
            pb.inc(1);
            if (i + 1) % 10 == 0 || i + 1 == total {
                info!(progress = format!("{}/{}", i + 1, total), "Downloading images");
            }
        }
        pb.finish_and_clear();

        info!(
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            dir = %output_dir.display(),
            "Image download complete"
        );
        Ok(summary)
    }

    async fn collect_file_titles(&self, start_category: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut pending = vec![start_category.to_string()];
        let mut titles = Vec::new();

        while let Some(category) = pending.pop() {
            if !visited.insert(category.clone()) {
                continue;
            }
            match self.category_members(&category).await {
                Ok(members) => {
                    for member in members {
                        match member.ns {
                            FILE_NAMESPACE => titles.push(member.title),
                            CATEGORY_NAMESPACE => pending.push(member.title),
                            _ => {}
                        }
                    }
                }
                Err(e) => error!(category = %category, error = %format!("{e:#}"), "Failed to fetch category"),
            }
        }
        titles
    }

    async fn category_members(&self, category: &str) -> Result<Vec<CategoryMember>> {
        let mut members = Vec::new();
        let mut continuation: BTreeMap<String, String> = BTreeMap::new();
        loop {
            let mut params: Vec<(String, String)> = [
                ("action", "query"),
                ("format", "json"),
                ("list", "categorymembers"),
                ("cmtitle", category),
                ("cmlimit", "500"),
                ("cmtype", "file|subcat"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
            params.extend(continuation.iter().map(|(k, v)| (k.clone(), v.clone())));

            let response: CategoryResponse = self
                .client
                .get(&self.api_url)
                .query(&params)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .context("Malformed categorymembers response")?;

            let (page, next) = split_category_response(response);
            debug!(category, batch = page.len(), "Fetched category members");
            members.extend(page);
            match next {
                Some(next) => continuation = next,
                None => break,
            }
        }
        Ok(members)
    }

    async fn download_image(&self, title: &str, output_dir: &Path) -> Result<Fetched> {
        let response: ImageInfoResponse = self
            .client
            .get(&self.api_url)
            .query(&[
                ("action", "query"),
                ("format", "json"),
                ("titles", title),
                ("prop", "imageinfo"),
                ("iiprop", "url"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Malformed imageinfo response")?;

        let Some(url) = image_url(response) else {
            bail!("No image URL for {title}");
        };
        let name = sanitize_file_name(&url);
        if name.is_empty() {
            bail!("Cannot derive a file name from {url}");
        }

        let output_path = output_dir.join(&name);
        if output_path.exists() {
            debug!(path = %output_path.display(), "Already downloaded");
            return Ok(Fetched::AlreadyPresent);
        }

        let bytes = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let staging = partial_path(output_dir, &name);
        tokio::fs::write(&staging, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &output_path).await?;
        Ok(Fetched::Downloaded)
    }
}

struct Selection {
    found: usize,
    titles: Vec<String>,
}

/// Deduplicate, sort and cap the crawled titles
fn select_titles(titles: Vec<String>, limit: usize) -> Selection {
    let unique: BTreeSet<String> = titles.into_iter().collect();
    Selection {
        found: unique.len(),
        titles: unique.into_iter().take(limit).collect(),
    }
}

fn split_category_response(
    response: CategoryResponse,
) -> (Vec<CategoryMember>, Option<BTreeMap<String, String>>) {
    let members = response.query.map(|q| q.categorymembers).unwrap_or_default();
    (members, response.continuation)
}

fn image_url(response: ImageInfoResponse) -> Option<String> {
    let pages = response.query?.pages;
    let mut ids: Vec<_> = pages.keys().cloned().collect();
    ids.sort();
    ids.into_iter()
        .filter_map(|id| pages.get(&id))
        .find_map(|page| page.imageinfo.first().map(|info| info.url.clone()))
}

/// Last URL path segment reduced to alphanumerics, `.` and `_`
pub fn sanitize_file_name(url: &str) -> String {
    let last = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default();
    last.chars()
        .filter(|c| c.is_alphanumeric() || *c == '.' || *c == '_')
        .collect()
}

fn partial_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(".{name}.partial"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_page_with_continuation() {
        let body = r#"{
            "batchcomplete": "",
            "continue": {"cmcontinue": "file|4142|123", "continue": "-||"},
            "query": {"categorymembers": [
                {"pageid": 1, "ns": 6, "title": "File:Mona Lisa.jpg"},
                {"pageid": 2, "ns": 14, "title": "Category:Portraits"},
                {"pageid": 3, "ns": 0, "title": "Some article"}
            ]}
        }"#;
        let response: CategoryResponse = serde_json::from_str(body).unwrap();
        let (members, next) = split_category_response(response);

        assert_eq!(members.len(), 3);
        assert_eq!(members[0].ns, FILE_NAMESPACE);
        assert_eq!(members[1].title, "Category:Portraits");
        let next = next.unwrap();
        assert_eq!(next["cmcontinue"], "file|4142|123");
        assert_eq!(next["continue"], "-||");
    }

    #[test]
    fn test_last_category_page_has_no_continuation() {
        let response: CategoryResponse = serde_json::from_str(r#"{"query": {"categorymembers": []}}"#).unwrap();
        let (members, next) = split_category_response(response);
        assert!(members.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn test_image_url_skips_missing_pages() {
        let body = r#"{"query": {"pages": {
            "-1": {"ns": 6, "title": "File:Gone.jpg", "missing": ""},
            "42": {"ns": 6, "title": "File:A.jpg", "imageinfo": [{"url": "https://upload.example.org/a/ab/A.jpg"}]}
        }}}"#;
        let response: ImageInfoResponse = serde_json::from_str(body).unwrap();
        assert_eq!(image_url(response).as_deref(), Some("https://upload.example.org/a/ab/A.jpg"));

        let empty: ImageInfoResponse = serde_json::from_str("{}").unwrap();
        assert!(image_url(empty).is_none());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(
            sanitize_file_name("https://upload.wikimedia.org/x/y/Mona_Lisa%2C_by (Leonardo).jpg"),
            "Mona_Lisa2C_byLeonardo.jpg"
        );
        assert_eq!(sanitize_file_name("https://host/a/b/plain.png?download=1"), "plain.png");
        assert_eq!(sanitize_file_name("https://host/dir/"), "");
    }

    #[test]
    fn test_select_titles_dedupes_sorts_and_limits() {
        let titles = ["File:c.jpg", "File:a.jpg", "File:c.jpg", "File:b.jpg"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let selection = select_titles(titles, 2);
        assert_eq!(selection.found, 3);
        assert_eq!(selection.titles, vec!["File:a.jpg", "File:b.jpg"]);
    }
}
