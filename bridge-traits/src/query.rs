//! Query Strategy Contract
//!
//! Turning a (title, artist, album) triple into search strings is owned by the
//! host. The core consumes the ordered list as given, most specific first.

/// Produces ordered search strings for a catalog track.
pub trait QueryStrategyProvider: Send + Sync {
    fn strategies(&self, title: &str, artist: &str, album: Option<&str>) -> Vec<String>;
}

/// Fixed strategy list: `"artist - title"`, then `"title artist"`, then `"title"`.
///
/// Useful for hosts that have no normalisation routine of their own.
#[derive(Debug, Clone, Default)]
pub struct BasicQueryStrategies;

impl QueryStrategyProvider for BasicQueryStrategies {
    fn strategies(&self, title: &str, artist: &str, _album: Option<&str>) -> Vec<String> {
        let title = title.trim();
        let artist = artist.trim();
        let mut out = Vec::with_capacity(3);
        if !artist.is_empty() {
            out.push(format!("{} - {}", artist, title));
            out.push(format!("{} {}", title, artist));
        }
        out.push(title.to_string());
        out.dedup();
        out
    }
}
