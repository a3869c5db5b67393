//! Parsed fields to canonical rows: type coercion, natural keys, JSON encoding of lists.

use chrono::{DateTime, NaiveDate, Utc};
use tdp_adapters::{Fetched, OpenWeatherAdapter, WikipediaAdapter};
use tdp_core::{
    DestinationRecord, ForecastRecord, ItemError, ParsedDestination, ParsedForecast,
    ParsedForecastDay,
};

use crate::coordinator::IngestSource;

pub fn destination_key(name: &str) -> String {
    name.trim().to_string()
}

pub fn forecast_key(city: &str, country: &str, date: NaiveDate) -> String {
    format!("{}|{}|{}", city.trim(), country.trim(), date.format("%Y-%m-%d"))
}

/// `"lat; lon"` into a checked pair.
pub fn parse_coordinates(text: &str) -> Result<(f64, f64), ItemError> {
    let invalid = |message: String| ItemError::validation("coordinates", message);
    let mut parts = text.split(';').map(str::trim);
    let (Some(lat), Some(lon), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid(format!("expected \"lat; lon\", got {text:?}")));
    };
    let lat: f64 = lat
        .parse()
        .map_err(|_| invalid(format!("latitude {lat:?} is not a number")))?;
    let lon: f64 = lon
        .parse()
        .map_err(|_| invalid(format!("longitude {lon:?} is not a number")))?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(invalid(format!("latitude {lat} out of range")));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(invalid(format!("longitude {lon} out of range")));
    }
    Ok((lat, lon))
}

/// First digit-and-comma run as the count, a parenthesised four-digit year as the year.
pub fn parse_population(text: &str) -> (Option<i64>, Option<i64>) {
    let count = text
        .find(|c: char| c.is_ascii_digit())
        .map(|start| {
            text[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == ',')
                .filter(char::is_ascii_digit)
                .collect::<String>()
        })
        .and_then(|digits| digits.parse().ok());

    let bytes = text.as_bytes();
    let year = (0..bytes.len().saturating_sub(5))
        .find(|&i| {
            bytes[i] == b'(' && bytes[i + 5] == b')' && bytes[i + 1..i + 5].iter().all(u8::is_ascii_digit)
        })
        .and_then(|i| text[i + 1..i + 5].parse().ok());

    (count, year)
}

fn json_text<T: serde::Serialize>(field: &str, value: &T) -> Result<String, ItemError> {
    serde_json::to_string(value).map_err(|err| ItemError::validation(field, err.to_string()))
}

pub fn normalize_destination(
    parsed: &ParsedDestination,
    fetched_at: DateTime<Utc>,
) -> Result<DestinationRecord, ItemError> {
    let destination_name = destination_key(&parsed.destination_name);
    if destination_name.is_empty() {
        return Err(ItemError::validation("destination_name", "empty destination name"));
    }

    let (latitude, longitude) = if parsed.coordinates.defaulted {
        (None, None)
    } else {
        let (lat, lon) = parse_coordinates(&parsed.coordinates.value)?;
        (Some(lat), Some(lon))
    };
    let (population_count, population_year) = parse_population(&parsed.population.value);

    Ok(DestinationRecord {
        destination_name,
        description: parsed.description.value.clone(),
        country: parsed.country.value.clone(),
        latitude,
        longitude,
        population_count,
        population_year,
        timezone: parsed.timezone.value.clone(),
        languages: json_text("languages", &parsed.languages.value)?,
        climate: parsed.climate.value.clone(),
        image_url: parsed.image_url.value.clone(),
        sections: json_text("sections", &parsed.sections.value)?,
        attractions_count: parsed.attractions.value.len() as i64,
        attractions: json_text("attractions", &parsed.attractions.value)?,
        ingestion_timestamp: fetched_at,
    })
}

fn epoch_to_utc(field: &str, secs: i64) -> Result<DateTime<Utc>, ItemError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ItemError::validation(field, format!("{secs} is not a valid epoch")))
}

fn optional_epoch(field: &str, secs: Option<i64>) -> Result<Option<DateTime<Utc>>, ItemError> {
    secs.map(|s| epoch_to_utc(field, s)).transpose()
}

fn normalize_day(
    parsed: &ParsedForecast,
    day: &ParsedForecastDay,
    fetched_at: DateTime<Utc>,
) -> Result<ForecastRecord, ItemError> {
    let dt = day
        .dt
        .ok_or_else(|| ItemError::validation("dt", "forecast day has no timestamp"))?;
    let forecast_timestamp = epoch_to_utc("dt", dt)?;
    let forecast_date = forecast_timestamp.date_naive();
    let loc = &parsed.location;

    Ok(ForecastRecord {
        logical_key: forecast_key(&loc.city, &loc.country, forecast_date),
        city: loc.city.trim().to_string(),
        country: loc.country.trim().to_string(),
        latitude: loc.latitude,
        longitude: loc.longitude,
        forecast_date,
        forecast_timestamp,
        max_temp: day.max_temp.value,
        min_temp: day.min_temp.value,
        day_temp: day.day_temp.value,
        night_temp: day.night_temp.value,
        feels_like_day: day.feels_like_day.value,
        feels_like_night: day.feels_like_night.value,
        humidity: day.humidity.value,
        wind_speed: day.wind_speed.value,
        weather_main: day.weather_main.value.clone(),
        weather_description: day.weather_description.value.clone(),
        weather_icon: day.weather_icon.value.clone(),
        precipitation_probability: day.precipitation_probability.value,
        rain: day.rain.value,
        uvi: day.uvi.value,
        clouds: day.clouds.value,
        sunrise: optional_epoch("sunrise", day.sunrise.value)?,
        sunset: optional_epoch("sunset", day.sunset.value)?,
        ingestion_timestamp: fetched_at,
    })
}

/// One record per forecast day. Any day without a usable timestamp fails the whole location.
pub fn normalize_forecast(
    parsed: &ParsedForecast,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<ForecastRecord>, ItemError> {
    if parsed.days.is_empty() {
        return Err(ItemError::validation("daily", "response has no forecast days"));
    }
    parsed
        .days
        .iter()
        .map(|day| normalize_day(parsed, day, fetched_at))
        .collect()
}

impl IngestSource for WikipediaAdapter {
    type Record = DestinationRecord;

    fn pipeline_name(&self) -> &'static str {
        "destinations"
    }

    fn normalize(&self, fetched: &Fetched<ParsedDestination>) -> Result<Vec<DestinationRecord>, ItemError> {
        Ok(vec![normalize_destination(&fetched.parsed, fetched.capture.fetched_at)?])
    }

    fn defaulted_fields(parsed: &ParsedDestination) -> Vec<&'static str> {
        parsed.defaulted_fields()
    }

    fn expected_records(&self, items: usize) -> usize {
        items
    }
}

impl IngestSource for OpenWeatherAdapter {
    type Record = ForecastRecord;

    fn pipeline_name(&self) -> &'static str {
        "weather"
    }

    fn normalize(&self, fetched: &Fetched<ParsedForecast>) -> Result<Vec<ForecastRecord>, ItemError> {
        normalize_forecast(&fetched.parsed, fetched.capture.fetched_at)
    }

    fn defaulted_fields(parsed: &ParsedForecast) -> Vec<&'static str> {
        parsed.defaulted_fields()
    }

    /// One record per location-day.
    fn expected_records(&self, items: usize) -> usize {
        items * self.forecast_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tdp_core::{Attraction, Extracted, Location};

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).single().expect("ts")
    }

    fn paris() -> ParsedDestination {
        ParsedDestination {
            destination_name: " Paris ".into(),
            description: Extracted::found("Capital of France.".into()),
            coordinates: Extracted::found("48.856613; 2.352222".into()),
            country: Extracted::found("France".into()),
            population: Extracted::found("2,102,650 (2023)".into()),
            timezone: Extracted::found("UTC+01:00".into()),
            languages: Extracted::found(vec!["French".into()]),
            climate: Extracted::defaulted_to(String::new()),
            image_url: Extracted::defaulted_to(String::new()),
            sections: Extracted::found(vec!["History".into(), "Geography".into()]),
            attractions: Extracted::found(vec![Attraction {
                name: "Eiffel Tower".into(),
                description: "Iron tower".into(),
                image_url: String::new(),
                kind: "building".into(),
            }]),
        }
    }

    fn day(dt: Option<i64>) -> ParsedForecastDay {
        ParsedForecastDay {
            dt,
            max_temp: Extracted::found(Some(18.5)),
            min_temp: Extracted::defaulted_to(None),
            day_temp: Extracted::found(Some(16.0)),
            night_temp: Extracted::found(Some(10.0)),
            feels_like_day: Extracted::found(Some(15.0)),
            feels_like_night: Extracted::found(Some(9.0)),
            humidity: Extracted::found(Some(62.0)),
            wind_speed: Extracted::found(Some(4.1)),
            weather_main: Extracted::found("Rain".into()),
            weather_description: Extracted::found("light rain".into()),
            weather_icon: Extracted::found("10d".into()),
            precipitation_probability: Extracted::found(0.6),
            rain: Extracted::defaulted_to(0.0),
            uvi: Extracted::found(4.2),
            clouds: Extracted::found(75.0),
            sunrise: Extracted::found(Some(1714537562)),
            sunset: Extracted::defaulted_to(None),
        }
    }

    fn forecast(days: Vec<ParsedForecastDay>) -> ParsedForecast {
        ParsedForecast {
            location: Location::new("London", "UK", 51.5074, -0.1278),
            requested_days: 2,
            available_days: days.len(),
            days,
        }
    }

    #[test]
    fn destination_key_is_stable_and_lists_are_json() {
        let a = normalize_destination(&paris(), fetched_at()).expect("record");
        let b = normalize_destination(&paris(), fetched_at()).expect("record");
        assert_eq!(a, b);
        assert_eq!(a.destination_name, "Paris");
        assert_eq!(a.latitude, Some(48.856613));
        assert_eq!(a.population_count, Some(2_102_650));
        assert_eq!(a.population_year, Some(2023));
        assert_eq!(a.languages, r#"["French"]"#);
        assert_eq!(a.sections, r#"["History","Geography"]"#);
        assert_eq!(a.attractions_count, 1);
        assert!(a.attractions.contains(r#""type":"building""#));
        assert_eq!(a.ingestion_timestamp, fetched_at());
    }

    #[test]
    fn missing_coordinates_are_null_but_garbage_is_rejected() {
        let mut parsed = paris();
        parsed.coordinates = Extracted::defaulted_to(String::new());
        let record = normalize_destination(&parsed, fetched_at()).expect("record");
        assert_eq!((record.latitude, record.longitude), (None, None));

        parsed.coordinates = Extracted::found("north; east".into());
        let err = normalize_destination(&parsed, fetched_at()).expect_err("bad coordinates");
        assert!(err.to_string().starts_with("ValidationError:coordinates"));

        assert!(parse_coordinates("95.0; 10.0").is_err());
        assert!(parse_coordinates("48.8").is_err());
    }

    #[test]
    fn population_parsing_tolerates_noise() {
        assert_eq!(parse_population("2,102,650 (2023)"), (Some(2_102_650), Some(2023)));
        assert_eq!(parse_population("approx. 8,804,190[3]"), (Some(8_804_190), None));
        assert_eq!(parse_population("unknown"), (None, None));
    }

    #[test]
    fn forecast_days_become_keyed_rows() {
        let records =
            normalize_forecast(&forecast(vec![day(Some(1714564800)), day(Some(1714651200))]), fetched_at())
                .expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].logical_key, "London|UK|2024-05-01");
        assert_eq!(records[1].logical_key, "London|UK|2024-05-02");
        assert_eq!(records[0].min_temp, None);
        assert_eq!(records[0].rain, 0.0);
        assert!(records[0].sunrise.is_some());
        assert!(records[0].sunset.is_none());
    }

    #[test]
    fn forecast_without_usable_days_is_invalid() {
        let err = normalize_forecast(&forecast(vec![]), fetched_at()).expect_err("no days");
        assert_eq!(err.to_string(), "ValidationError:daily: response has no forecast days");

        let err = normalize_forecast(&forecast(vec![day(Some(1714564800)), day(None)]), fetched_at())
            .expect_err("missing dt");
        assert!(err.to_string().starts_with("ValidationError:dt"));
    }
}
