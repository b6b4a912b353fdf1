//! Branch naming for the git-backed scenario representation.

use regex_lite::Regex;

const MAX_SLUG_LEN: usize = 40;

/// Lowercase, dash-separated form of a scenario name.
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let slug = match Regex::new(r"[^a-z0-9]+") {
        Ok(re) => re.replace_all(&lowered, "-").into_owned(),
        Err(_) => lowered
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect(),
    };
    let slug = slug.trim_matches('-');
    let mut slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "scenario".to_string()
    } else {
        slug
    }
}

/// `scenario/<slug>-<first 8 chars of id>`.
pub fn branch_name_for(name: &str, scenario_id: &str) -> String {
    let short: String = scenario_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!("scenario/{}-{}", slugify(name), short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Best Case!"), "best-case");
        assert_eq!(slugify("  Q3 / Hiring plan  "), "q3-hiring-plan");
        assert_eq!(slugify("***"), "scenario");
        assert!(slugify(&"x".repeat(100)).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn test_branch_name_for() {
        let name = branch_name_for("What If", "1b4e28ba-2fa1-11d2-883f-0016d3cca427");
        assert_eq!(name, "scenario/what-if-1b4e28ba");
    }
}
