use chrono::{Datelike, NaiveDate};

/// Season digit at the end of a 4-character SIS term id.
/// `2228` is Fall 2022; `1995` is Summer 1999.
const SEASONS: [(char, &str, &str); 4] = [
    ('0', "A", "Winter"),
    ('2', "B", "Spring"),
    ('5', "C", "Summer"),
    ('8', "D", "Fall"),
];

pub fn is_valid_term_id(term_id: &str) -> bool {
    term_id.len() == 4
        && term_id.chars().all(|c| c.is_ascii_digit())
        && SEASONS.iter().any(|(d, _, _)| term_id.ends_with(*d))
}

fn term_year(term_id: &str) -> String {
    let century = if term_id.starts_with('1') { "19" } else { "20" };
    format!("{}{}", century, &term_id[1..3])
}

/// Vendor-facing term code, e.g. `2022-B` for `2222`.
pub fn term_code_for_sis_id(term_id: &str) -> Option<String> {
    if !is_valid_term_id(term_id) {
        return None;
    }
    let season = term_id.chars().last()?;
    let code = SEASONS.iter().find(|(d, _, _)| *d == season)?.1;
    Some(format!("{}-{}", term_year(term_id), code))
}

/// Human-readable term name, e.g. `Spring 2022` for `2222`.
pub fn term_name_for_sis_id(term_id: &str) -> Option<String> {
    if !is_valid_term_id(term_id) {
        return None;
    }
    let season = term_id.chars().last()?;
    let name = SEASONS.iter().find(|(d, _, _)| *d == season)?.2;
    Some(format!("{} {}", name, term_year(term_id)))
}

/// SIS id of each term in the range, oldest to newest. Term ids step by 3
/// between seasons and by 4 across the Fall/Winter year boundary.
pub fn term_ids_range(earliest_term_id: &str, latest_term_id: &str) -> Vec<String> {
    let (Ok(mut term_id), Ok(latest)) = (
        earliest_term_id.parse::<i64>(),
        latest_term_id.parse::<i64>(),
    ) else {
        return Vec::new();
    };
    let mut ids = Vec::new();
    while term_id <= latest {
        ids.push(term_id.to_string());
        term_id += if term_id % 10 == 8 { 4 } else { 3 };
    }
    ids
}

/// Spring and Fall terms end with finals; the standard meeting end date is
/// the Friday before finals week and gets bumped to the following Sunday.
pub fn ends_before_finals_week(term_id: &str) -> bool {
    term_id.ends_with('2') || term_id.ends_with('8')
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Vendor flat files carry US-style dates.
pub fn format_date_mdy(d: NaiveDate) -> String {
    format!("{:02}-{:02}-{}", d.month(), d.day(), d.year())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_codes_and_names() {
        assert_eq!(term_code_for_sis_id("2222").as_deref(), Some("2022-B"));
        assert_eq!(term_code_for_sis_id("2228").as_deref(), Some("2022-D"));
        assert_eq!(term_code_for_sis_id("1995").as_deref(), Some("1999-C"));
        assert_eq!(term_name_for_sis_id("2222").as_deref(), Some("Spring 2022"));
        assert_eq!(term_name_for_sis_id("2230").as_deref(), Some("Winter 2023"));
        assert_eq!(term_code_for_sis_id("22"), None);
        assert_eq!(term_code_for_sis_id("2223"), None);
    }

    #[test]
    fn term_range_steps_over_year_boundary() {
        assert_eq!(
            term_ids_range("2218", "2225"),
            vec!["2218", "2222", "2225"]
        );
        assert_eq!(term_ids_range("2228", "2232"), vec!["2228", "2232"]);
        assert!(term_ids_range("2225", "2222").is_empty());
    }

    #[test]
    fn date_formats() {
        let d = NaiveDate::from_ymd_opt(2022, 4, 11).unwrap();
        assert_eq!(format_date(d), "2022-04-11");
        assert_eq!(format_date_mdy(d), "04-11-2022");
        assert_eq!(parse_date("2022-04-11"), Some(d));
        assert_eq!(parse_date("04/11/2022"), None);
    }
}
