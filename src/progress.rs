//! Console progress bars for the long per-item loops
//!
//! Bars draw on stderr and hide themselves when it is not a terminal, so
//! tests and redirected runs only see the tracing output.

use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str = "{msg:>12} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta})";

/// Bar over `len` items labelled `label`
pub fn bar(len: usize, label: &'static str) -> ProgressBar {
    let style = ProgressStyle::with_template(TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    let pb = ProgressBar::new(len as u64);
    pb.set_style(style);
    pb.set_message(label);
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_tracks_position() {
        let pb = bar(3, "Masking");
        pb.inc(1);
        pb.inc(1);
        assert_eq!(pb.position(), 2);
        assert_eq!(pb.length(), Some(3));
        pb.finish_and_clear();
    }
}
