/// The fixed set of main topics a group can be filed under. Grouping and
/// trend analysis both iterate this list; LLM responses are normalized
/// against it.
pub const CATEGORIES: [&str; 10] = [
    "Science & Environment",
    "Business, Finance & Trade",
    "Artificial Intelligence & Machine Learning",
    "Software Development & Open Source",
    "Cybersecurity & Data Privacy",
    "Politics & Government",
    "Consumer Technology & Gadgets",
    "Automotive, Space & Transportation",
    "Enterprise Technology & Cloud Computing",
    "Other",
];

pub const FALLBACK_CATEGORY: &str = "Other";

/// Map a free-form category string (typically out of an LLM response) onto
/// the fixed set. Unknown values collapse to `Other`.
pub fn normalize(raw: &str) -> &'static str {
    let trimmed = raw.trim();
    CATEGORIES
        .iter()
        .find(|c| c.eq_ignore_ascii_case(trimmed))
        .copied()
        .unwrap_or(FALLBACK_CATEGORY)
}
