// src/utils/url.rs

//! Permalink helpers.

use url::Url;

/// Query keys that carry an entity id, most specific first.
const ID_QUERY_KEYS: [&str; 4] = ["reply_comment_id", "comment_id", "story_fbid", "fbid"];

/// Path segments that precede an entity id.
const ID_PATH_MARKERS: [&str; 6] = ["posts", "permalink", "videos", "photos", "reel", "comments"];

/// Extract the numeric entity id embedded in a canonical permalink.
///
/// Looks at well-known query keys first, then at the segment following a
/// known path marker. Only pure digit sequences qualify. Relative
/// permalinks (no scheme) are matched with plain patterns instead.
///
/// # Examples
/// ```
/// use harvester::utils::url::extract_permalink_id;
///
/// assert_eq!(
///     extract_permalink_id("https://example.com/groups/9/posts/1234567/"),
///     Some("1234567".to_string())
/// );
/// ```
pub fn extract_permalink_id(permalink: &str) -> Option<String> {
    let Ok(parsed) = Url::parse(permalink) else {
        return extract_from_relative(permalink);
    };

    for wanted in ID_QUERY_KEYS {
        let hit = parsed
            .query_pairs()
            .find(|(key, value)| key == wanted && is_digits(value));
        if let Some((_, value)) = hit {
            return Some(value.into_owned());
        }
    }

    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    segments
        .windows(2)
        .rev()
        .find(|pair| ID_PATH_MARKERS.contains(&pair[0]) && is_digits(pair[1]))
        .map(|pair| pair[1].to_string())
}

/// Pattern match for permalinks that are not absolute URLs.
fn extract_from_relative(permalink: &str) -> Option<String> {
    // e.g. /groups/42/posts/9001/, /permalink.php?story_fbid=123
    let patterns = [
        regex::Regex::new(r"[?&](?:reply_comment_id|comment_id|story_fbid|fbid)=(\d+)").ok()?,
        regex::Regex::new(r"/(?:posts|permalink|videos|photos|reel|comments)/(\d+)").ok()?,
    ];

    patterns.iter().find_map(|pattern| {
        pattern
            .captures(permalink)
            .and_then(|caps| caps.get(1))
            .map(|id| id.as_str().to_string())
    })
}

/// Whether `s` is a non-empty run of ASCII digits.
pub fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}
