//! Archive selection for restores.
//!
//! The store lists archives oldest-first; the operator sees them most
//! recent first and picks by number, by name, or takes the most recent with
//! an empty answer. Non-interactive callers pass the archive id directly.

use std::io::Write;
use std::path::PathBuf;

use tracing::info;

use crate::archive::{ArchiveDescriptor, ArchiveStore};
use crate::error::{BackupError, Result};
use crate::job::{JobContext, RestoreScope, RestoreSelection};

pub struct RestoreCoordinator<'a> {
    store: &'a dyn ArchiveStore,
}

impl<'a> RestoreCoordinator<'a> {
    pub fn new(store: &'a dyn ArchiveStore) -> Self {
        Self { store }
    }

    /// Build the selection the orchestrator will consume. With a
    /// preselected id (scheduler path) no prompt is shown; otherwise the
    /// operator picks from the listing.
    pub async fn select(
        &self,
        ctx: &JobContext,
        preselected: Option<String>,
        target: PathBuf,
        scope: RestoreScope,
        assume_yes: bool,
    ) -> Result<RestoreSelection> {
        let archives = self.store.list(ctx).await?;
        if archives.is_empty() {
            return Err(BackupError::ArchiveData(
                "repository contains no archives".to_string(),
            ));
        }

        let archive_id = match preselected {
            Some(id) => {
                if !archives.iter().any(|a| a.id == id) {
                    return Err(BackupError::ArchiveData(format!(
                        "archive '{id}' not found in repository"
                    )));
                }
                id
            }
            None => self.prompt_for_archive(&archives).await?,
        };

        if !assume_yes && !confirm_overwrite(&archive_id, &target).await? {
            return Err(BackupError::Cancelled);
        }

        info!(archive = %archive_id, target = %target.display(), "restore selection made");
        Ok(RestoreSelection {
            archive_id,
            target,
            scope,
        })
    }

    async fn prompt_for_archive(&self, archives: &[ArchiveDescriptor]) -> Result<String> {
        for line in present(archives) {
            println!("{line}");
        }
        loop {
            let answer = read_line("Archive (number/name/Enter=most recent): ").await?;
            match choose(archives, &answer) {
                Some(id) => return Ok(id),
                None => println!("invalid selection"),
            }
        }
    }
}

/// Listing lines, most recent first.
pub fn present(archives: &[ArchiveDescriptor]) -> Vec<String> {
    archives
        .iter()
        .rev()
        .enumerate()
        .map(|(i, a)| format!("{}. {:<40} {}", i + 1, a.id, a.created.format("%Y-%m-%d %H:%M:%S")))
        .collect()
}

/// Resolve an operator answer against the listing. Numbers index the
/// presented (most-recent-first) order; an empty answer is the most recent.
pub fn choose(archives: &[ArchiveDescriptor], answer: &str) -> Option<String> {
    let answer = answer.trim();
    if answer.is_empty() {
        return archives.last().map(|a| a.id.clone());
    }
    if let Ok(index) = answer.parse::<usize>() {
        if index >= 1 && index <= archives.len() {
            return Some(archives[archives.len() - index].id.clone());
        }
        return None;
    }
    archives
        .iter()
        .find(|a| a.id == answer)
        .map(|a| a.id.clone())
}

async fn confirm_overwrite(archive_id: &str, target: &std::path::Path) -> Result<bool> {
    println!("restoring '{archive_id}' into {}", target.display());
    let answer = read_line("Overwrite? y/N: ").await?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

/// Stdin is blocking; keep the runtime responsive while waiting.
pub async fn read_line(prompt: &str) -> Result<String> {
    let prompt = prompt.to_string();
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        print!("{prompt}");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn archives() -> Vec<ArchiveDescriptor> {
        ["2026-Jan-24_03-00-01", "2026-Jan-25_15-05-12-nightly", "2026-Jan-26_03-00-02"]
            .iter()
            .enumerate()
            .map(|(i, id)| ArchiveDescriptor {
                id: id.to_string(),
                size: None,
                created: Utc.with_ymd_and_hms(2026, 1, 24 + i as u32, 3, 0, 1).unwrap(),
            })
            .collect()
    }

    #[test]
    fn presentation_is_most_recent_first() {
        let lines = present(&archives());
        assert!(lines[0].starts_with("1. 2026-Jan-26_03-00-02"));
        assert!(lines[2].starts_with("3. 2026-Jan-24_03-00-01"));
    }

    #[test]
    fn empty_answer_selects_most_recent() {
        assert_eq!(
            choose(&archives(), "").as_deref(),
            Some("2026-Jan-26_03-00-02")
        );
        assert_eq!(
            choose(&archives(), "  ").as_deref(),
            Some("2026-Jan-26_03-00-02")
        );
    }

    #[test]
    fn numeric_answer_indexes_presented_order() {
        // 1 = most recent, 3 = oldest.
        assert_eq!(
            choose(&archives(), "1").as_deref(),
            Some("2026-Jan-26_03-00-02")
        );
        assert_eq!(
            choose(&archives(), "3").as_deref(),
            Some("2026-Jan-24_03-00-01")
        );
        assert_eq!(choose(&archives(), "4"), None);
        assert_eq!(choose(&archives(), "0"), None);
    }

    #[test]
    fn name_answer_matches_exactly() {
        assert_eq!(
            choose(&archives(), "2026-Jan-25_15-05-12-nightly").as_deref(),
            Some("2026-Jan-25_15-05-12-nightly")
        );
        assert_eq!(choose(&archives(), "nope"), None);
    }
}
