use serde_json::Value as JsonValue;
use tdp_core::{
    Extracted, ItemError, Location, ParsedForecast, ParsedForecastDay, RawCapture, SourceItem,
};
use tdp_storage::SourceRequest;

use crate::{json_f64, json_i64, json_str, SourceAdapter};

/// Daily forecasts from a OneCall-style weather API, one request per location.
#[derive(Debug, Clone)]
pub struct OpenWeatherAdapter {
    base_url: String,
    api_key: String,
    forecast_days: usize,
}

impl OpenWeatherAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, forecast_days: usize) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            forecast_days,
        }
    }

    pub fn forecast_days(&self) -> usize {
        self.forecast_days
    }
}

impl SourceAdapter for OpenWeatherAdapter {
    type Parsed = ParsedForecast;

    fn source_id(&self) -> &'static str {
        "openweather"
    }

    fn archive_prefix(&self) -> &'static str {
        "raw/weather"
    }

    fn request_for(&self, item: &SourceItem) -> Result<SourceRequest, ItemError> {
        let SourceItem::Location(location) = item else {
            return Err(ItemError::validation(
                "source_item",
                "forecasts are looked up by coordinates, not page name",
            ));
        };
        location
            .check_bounds()
            .map_err(|message| ItemError::validation("coordinates", message))?;

        Ok(SourceRequest::get(format!(
            "{}/data/2.5/onecall",
            self.base_url.trim_end_matches('/')
        ))
        .with_query("lat", location.latitude)
        .with_query("lon", location.longitude)
        .with_query("appid", &self.api_key)
        .with_query("units", "metric")
        .with_query("exclude", "minutely,hourly,alerts"))
    }

    fn parse(&self, item: &SourceItem, capture: &RawCapture) -> ParsedForecast {
        let location = match item {
            SourceItem::Location(location) => location.clone(),
            SourceItem::Destination { name } => Location::new(name, "", 0.0, 0.0),
        };
        extract_forecast(&location, &capture.payload_text(), self.forecast_days)
    }
}

/// Takes up to `forecast_days` entries from the `daily` array. Unparsable bodies yield no days.
pub fn extract_forecast(location: &Location, body: &str, forecast_days: usize) -> ParsedForecast {
    let daily = serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|value| value.get("daily").and_then(JsonValue::as_array).cloned())
        .unwrap_or_default();

    ParsedForecast {
        location: location.clone(),
        requested_days: forecast_days,
        available_days: daily.len(),
        days: daily.iter().take(forecast_days).map(extract_day).collect(),
    }
}

fn optional_f64(day: &JsonValue, path: &[&str]) -> Extracted<Option<f64>> {
    match json_f64(day, path) {
        Some(v) => Extracted::found(Some(v)),
        None => Extracted::defaulted_to(None),
    }
}

fn zero_default(day: &JsonValue, key: &str) -> Extracted<f64> {
    Extracted::or_else_default(json_f64(day, &[key]), 0.0)
}

fn weather_text(day: &JsonValue, key: &str) -> Extracted<String> {
    Extracted::from_option(json_str(day, &["weather", "0", key]).map(str::to_string))
}

fn epoch(day: &JsonValue, key: &str) -> Extracted<Option<i64>> {
    match json_i64(day, &[key]) {
        Some(v) => Extracted::found(Some(v)),
        None => Extracted::defaulted_to(None),
    }
}

fn extract_day(day: &JsonValue) -> ParsedForecastDay {
    ParsedForecastDay {
        dt: json_i64(day, &["dt"]),
        max_temp: optional_f64(day, &["temp", "max"]),
        min_temp: optional_f64(day, &["temp", "min"]),
        day_temp: optional_f64(day, &["temp", "day"]),
        night_temp: optional_f64(day, &["temp", "night"]),
        feels_like_day: optional_f64(day, &["feels_like", "day"]),
        feels_like_night: optional_f64(day, &["feels_like", "night"]),
        humidity: optional_f64(day, &["humidity"]),
        wind_speed: optional_f64(day, &["wind_speed"]),
        weather_main: weather_text(day, "main"),
        weather_description: weather_text(day, "description"),
        weather_icon: weather_text(day, "icon"),
        precipitation_probability: zero_default(day, "pop"),
        rain: zero_default(day, "rain"),
        uvi: zero_default(day, "uvi"),
        clouds: zero_default(day, "clouds"),
        sunrise: epoch(day, "sunrise"),
        sunset: epoch(day, "sunset"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn london() -> Location {
        Location::new("London", "UK", 51.5074, -0.1278)
    }

    #[test]
    fn request_carries_coordinates_and_metric_units() {
        let adapter = OpenWeatherAdapter::new("https://api.openweathermap.org/", "k3y", 2);
        let req = adapter
            .request_for(&SourceItem::Location(london()))
            .expect("request");
        assert_eq!(req.url, "https://api.openweathermap.org/data/2.5/onecall");
        assert!(req.query.contains(&("units".to_string(), "metric".to_string())));
        assert!(req.query.contains(&("lat".to_string(), "51.5074".to_string())));
        assert!(req.query.contains(&("exclude".to_string(), "minutely,hourly,alerts".to_string())));
    }

    #[test]
    fn out_of_range_location_is_a_validation_error() {
        let adapter = OpenWeatherAdapter::new("https://api.openweathermap.org", "k", 2);
        let err = adapter
            .request_for(&SourceItem::Location(Location::new("Nowhere", "XX", 91.0, 0.0)))
            .expect_err("latitude out of range");
        assert!(err.to_string().starts_with("ValidationError:coordinates"));
    }

    #[test]
    fn missing_optional_measures_default_to_zero_and_are_flagged() {
        let body = r#"{"daily":[{"dt":1714564800,"temp":{"max":18.5,"min":9.1,"day":16.0,"night":10.2},
            "feels_like":{"day":15.4,"night":9.0},"humidity":62,"wind_speed":4.1,
            "weather":[{"main":"Clouds","description":"broken clouds","icon":"04d"}],
            "sunrise":1714538000,"sunset":1714592000}]}"#;
        let parsed = extract_forecast(&london(), body, 2);
        assert_eq!(parsed.available_days, 1);
        assert_eq!(parsed.days.len(), 1);
        let day = &parsed.days[0];
        assert_eq!(day.max_temp.value, Some(18.5));
        assert_eq!(day.humidity.value, Some(62.0));
        assert_eq!(day.rain.value, 0.0);
        assert!(day.rain.defaulted);
        assert_eq!(
            parsed.defaulted_fields(),
            vec!["precipitation_probability", "rain", "uvi", "clouds"]
        );
    }

    #[test]
    fn day_count_is_capped_and_garbage_yields_nothing() {
        let body = r#"{"daily":[{"dt":1},{"dt":2},{"dt":3}]}"#;
        let parsed = extract_forecast(&london(), body, 2);
        assert_eq!(parsed.available_days, 3);
        assert_eq!(parsed.days.len(), 2);

        let empty = extract_forecast(&london(), "<html>bad gateway</html>", 2);
        assert!(empty.days.is_empty());
        assert_eq!(empty.available_days, 0);
    }
}
