use std::path::{Path, PathBuf};

use tdp_adapters::{extract_destination, extract_forecast};
use tdp_core::Location;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(relative: &str) -> String {
    std::fs::read_to_string(workspace_root().join("fixtures").join(relative)).expect("fixture")
}

#[test]
fn paris_page_yields_every_field() {
    let parsed = extract_destination(&fixture("wikipedia/paris.html"), "Paris");

    assert!(parsed.defaulted_fields().is_empty(), "{:?}", parsed.defaulted_fields());
    assert!(parsed
        .description
        .value
        .starts_with("Paris is the capital and largest city of France. With"));
    assert!(!parsed.description.value.contains('['));
    assert_eq!(parsed.coordinates.value, "48.856613; 2.352222");
    assert_eq!(parsed.country.value, "France");
    assert_eq!(parsed.population.value, "2,102,650 (2023)");
    assert_eq!(parsed.timezone.value, "UTC+01:00 (CET)");
    assert_eq!(parsed.languages.value, vec!["French".to_string()]);
    assert!(parsed.climate.value.starts_with("Paris has a typical Western European oceanic climate"));
    assert!(parsed.image_url.value.starts_with("https://upload.wikimedia.org/"));
    assert_eq!(
        parsed.sections.value,
        vec!["Etymology", "Geography", "Climate", "Tourism"]
    );
}

#[test]
fn paris_attractions_are_deduplicated_in_page_order() {
    let parsed = extract_destination(&fixture("wikipedia/paris.html"), "Paris");
    let attractions = &parsed.attractions.value;
    let names: Vec<&str> = attractions.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Cathedral of Notre-Dame",
            "Eiffel Tower",
            "Louvre Museum",
            "Tuileries Garden",
            "Pont Neuf"
        ]
    );

    let kinds: Vec<&str> = attractions.iter().map(|a| a.kind.as_str()).collect();
    assert_eq!(kinds, vec!["religious", "building", "museum", "park", "landmark"]);

    assert_eq!(
        attractions[1].description,
        "wrought-iron lattice tower on the Champ de Mars, completed in 1889."
    );
    assert_eq!(attractions[2].description, "the world's most-visited art museum");
    assert_eq!(attractions[2].image_url, "https://upload.wikimedia.org/louvre.jpg");
}

#[test]
fn london_forecast_takes_requested_days_and_flags_missing_rain() {
    let london = Location::new("London", "UK", 51.5074, -0.1278);
    let parsed = extract_forecast(&london, &fixture("openweather/london.json"), 2);

    assert_eq!(parsed.available_days, 3);
    assert_eq!(parsed.days.len(), 2);
    assert_eq!(parsed.days[0].dt, Some(1714564800));
    assert_eq!(parsed.days[0].max_temp.value, Some(18.5));
    assert_eq!(parsed.days[0].weather_main.value, "Rain");
    assert_eq!(parsed.days[0].rain.value, 1.37);
    assert!(parsed.days[1].rain.defaulted);
    assert_eq!(parsed.defaulted_fields(), vec!["rain"]);
}
