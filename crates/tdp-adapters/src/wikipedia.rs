use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use tdp_core::{Attraction, Extracted, ItemError, ParsedDestination, RawCapture, SourceItem};
use tdp_storage::SourceRequest;

use crate::{text_or_none, SourceAdapter};

const CLIMATE_SECTION_IDS: [&str; 4] = ["Climate", "Geography_and_climate", "Weather", "Environment"];

const ATTRACTION_SECTION_IDS: [&str; 9] = [
    "Attractions",
    "Tourism",
    "Landmarks",
    "Sights",
    "Tourist_attractions",
    "Places_of_interest",
    "Main_sights",
    "Notable_attractions",
    "Points_of_interest",
];

const EXCLUDED_SECTIONS: [&str; 5] = ["References", "External links", "See also", "Notes", "Contents"];

const NON_CONTENT_SECTIONS: [&str; 5] = ["References", "External links", "See also", "Notes", "Bibliography"];

const ATTRACTION_KEYWORDS: [&str; 12] = [
    "museum",
    "monument",
    "park",
    "palace",
    "castle",
    "cathedral",
    "temple",
    "landmark",
    "attraction",
    "garden",
    "square",
    "tower",
];

const ATTRACTION_TYPES: [(&str, &[&str]); 12] = [
    ("museum", &["museum", "gallery", "exhibition"]),
    ("palace", &["palace", "castle", "mansion", "estate"]),
    ("park", &["park", "garden", "botanical"]),
    ("religious", &["cathedral", "church", "temple", "mosque", "shrine", "chapel"]),
    ("monument", &["monument", "memorial", "statue"]),
    ("building", &["tower", "skyscraper", "building", "center", "centre"]),
    ("square", &["square", "plaza", "piazza"]),
    ("theatre", &["theater", "theatre", "opera"]),
    ("bridge", &["bridge", "tunnel"]),
    ("zoo", &["zoo", "aquarium"]),
    ("beach", &["beach", "coast", "shore"]),
    ("market", &["market", "bazaar", "shopping"]),
];

/// Destination pages from an encyclopedia-style wiki.
#[derive(Debug, Clone)]
pub struct WikipediaAdapter {
    base_url: String,
}

impl WikipediaAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn page_url(&self, destination: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            destination.trim().replace(' ', "_")
        )
    }
}

impl SourceAdapter for WikipediaAdapter {
    type Parsed = ParsedDestination;

    fn source_id(&self) -> &'static str {
        "wikipedia"
    }

    fn archive_prefix(&self) -> &'static str {
        "raw/wiki"
    }

    fn request_for(&self, item: &SourceItem) -> Result<SourceRequest, ItemError> {
        match item {
            SourceItem::Destination { name } if !name.trim().is_empty() => {
                Ok(SourceRequest::get(self.page_url(name)))
            }
            SourceItem::Destination { .. } => {
                Err(ItemError::validation("destination_name", "empty destination name"))
            }
            SourceItem::Location(_) => Err(ItemError::validation(
                "source_item",
                "destination pages are looked up by name, not coordinates",
            )),
        }
    }

    fn parse(&self, item: &SourceItem, capture: &RawCapture) -> ParsedDestination {
        let name = match item {
            SourceItem::Destination { name } => name.trim().to_string(),
            SourceItem::Location(loc) => loc.city.clone(),
        };
        extract_destination(&capture.payload_text(), &name)
    }
}

/// Pulls every destination field it can find. Absent fields come back defaulted.
pub fn extract_destination(html: &str, destination: &str) -> ParsedDestination {
    let doc = Html::parse_document(html);
    let rows = infobox_rows(&doc);

    let population = infobox_lookup(&rows, |label| label.contains("Population"))
        .and_then(|td| text_or_none(strip_citations(&element_text(td))));

    ParsedDestination {
        destination_name: destination.to_string(),
        description: Extracted::from_option(extract_description(&doc)),
        coordinates: Extracted::from_option(
            selector(".geo")
                .and_then(|sel| doc.select(&sel).next())
                .and_then(|geo| text_or_none(element_text(geo))),
        ),
        country: Extracted::from_option(
            infobox_lookup(&rows, |label| label.contains("Country") || label.contains("Location"))
                .and_then(|td| text_or_none(strip_citations(&element_text(td)))),
        ),
        population: Extracted::from_option(population),
        timezone: Extracted::from_option(
            infobox_lookup(&rows, |label| label.contains("Time zone"))
                .and_then(|td| text_or_none(strip_citations(&element_text(td)))),
        ),
        languages: Extracted::from_option(extract_languages(&rows)),
        climate: Extracted::from_option(extract_climate(&doc)),
        image_url: Extracted::from_option(extract_main_image(&doc)),
        sections: Extracted::from_option(extract_section_titles(&doc)),
        attractions: Extracted::from_option(extract_attractions(&doc)),
    }
}

/// Keyword lookup on the attraction name; `landmark` when nothing matches.
pub fn guess_attraction_type(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    ATTRACTION_TYPES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(kind, _)| *kind)
        .unwrap_or("landmark")
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

/// Drops numeric reference markers such as `[12]`.
fn strip_citations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('[') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let digits = tail.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits > 0 && tail.as_bytes().get(digits) == Some(&b']') {
            rest = &tail[digits + 1..];
        } else {
            out.push('[');
            rest = tail;
        }
    }
    out.push_str(rest);
    out
}

fn absolute_url(src: &str) -> String {
    if src.starts_with("//") {
        format!("https:{src}")
    } else {
        src.to_string()
    }
}

struct InfoboxRow<'a> {
    label: String,
    value: Option<ElementRef<'a>>,
}

fn infobox_rows(doc: &Html) -> Vec<InfoboxRow<'_>> {
    let (Some(infobox), Some(tr), Some(th), Some(td)) = (
        selector(".infobox"),
        selector("tr"),
        selector("th"),
        selector("td"),
    ) else {
        return Vec::new();
    };
    let Some(infobox) = doc.select(&infobox).next() else {
        return Vec::new();
    };
    infobox
        .select(&tr)
        .map(|row| InfoboxRow {
            label: row.select(&th).next().map(element_text).unwrap_or_default(),
            value: row.select(&td).next(),
        })
        .collect()
}

/// Value cell of the first matching row, or of the row right after a header-only match.
fn infobox_lookup<'a>(rows: &[InfoboxRow<'a>], matches: impl Fn(&str) -> bool) -> Option<ElementRef<'a>> {
    let idx = rows.iter().position(|row| matches(&row.label))?;
    rows[idx]
        .value
        .or_else(|| rows.get(idx + 1).and_then(|row| row.value))
}

fn extract_description(doc: &Html) -> Option<String> {
    let sel = selector("#mw-content-text > div > p:not(.mw-empty-elt)")?;
    doc.select(&sel)
        .find_map(|p| text_or_none(strip_citations(&element_text(p))))
}

fn extract_languages(rows: &[InfoboxRow<'_>]) -> Option<Vec<String>> {
    let td = infobox_lookup(rows, |label| label.to_lowercase().contains("language"))?;
    let li = selector("li")?;
    let items: Vec<String> = td.select(&li).map(element_text).collect();
    let raw = if items.is_empty() {
        vec![element_text(td)]
    } else {
        items
    };
    let languages: Vec<String> = raw
        .iter()
        .flat_map(|chunk| chunk.split([',', '\n']))
        .filter_map(|lang| text_or_none(strip_citations(lang)))
        .collect();
    (!languages.is_empty()).then_some(languages)
}

fn extract_main_image(doc: &Html) -> Option<String> {
    let sel = selector(".infobox .image img, .infobox .infobox-image img")?;
    doc.select(&sel)
        .next()
        .and_then(|img| img.value().attr("src"))
        .and_then(text_or_none)
        .map(|src| absolute_url(&src))
}

fn is_heading(el: ElementRef<'_>) -> bool {
    matches!(el.value().name(), "h2" | "h3" | "h4")
}

fn is_section_boundary(el: ElementRef<'_>) -> bool {
    is_heading(el) || el.value().classes().any(|c| c == "mw-heading")
}

/// Headline text, with the legacy `mw-headline` span preferred and edit links dropped.
fn heading_title(heading: ElementRef<'_>) -> String {
    let headline = selector(".mw-headline").and_then(|sel| heading.select(&sel).next());
    let text = element_text(headline.unwrap_or(heading));
    text.trim().trim_end_matches("[edit]").trim().to_string()
}

fn heading_ids<'a>(heading: ElementRef<'a>) -> Vec<&'a str> {
    let mut ids: Vec<&str> = heading.value().id().into_iter().collect();
    if let Some(span) = selector("span[id]") {
        ids.extend(heading.select(&span).filter_map(|s| s.value().id()));
    }
    ids
}

fn headings(doc: &Html) -> Vec<ElementRef<'_>> {
    selector("h2, h3, h4")
        .map(|sel| doc.select(&sel).collect())
        .unwrap_or_default()
}

/// The node whose following siblings hold the section body.
fn section_anchor(heading: ElementRef<'_>) -> ElementRef<'_> {
    match heading.parent().and_then(ElementRef::wrap) {
        Some(parent) if parent.value().classes().any(|c| c == "mw-heading") => parent,
        _ => heading,
    }
}

fn extract_climate(doc: &Html) -> Option<String> {
    let heading = headings(doc)
        .into_iter()
        .find(|h| heading_ids(*h).iter().any(|id| CLIMATE_SECTION_IDS.contains(id)))?;
    let heading_node = *heading;
    doc.root_element()
        .descendants()
        .skip_while(|node| node.id() != heading_node.id())
        .skip(1)
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "p")
        .find_map(|p| text_or_none(strip_citations(&element_text(p))))
}

fn extract_section_titles(doc: &Html) -> Option<Vec<String>> {
    let sel = selector("h2, h3")?;
    let titles: Vec<String> = doc
        .select(&sel)
        .map(heading_title)
        .filter(|title| !title.is_empty() && !EXCLUDED_SECTIONS.contains(&title.as_str()))
        .collect();
    (!titles.is_empty()).then_some(titles)
}

fn is_attraction_heading(heading: ElementRef<'_>) -> bool {
    let ids = heading_ids(heading);
    let title = heading_title(heading);
    ATTRACTION_SECTION_IDS
        .iter()
        .any(|wanted| ids.contains(wanted) || title.contains(&wanted.replace('_', " ")))
}

fn extract_attractions(doc: &Html) -> Option<Vec<Attraction>> {
    let mut found: Vec<Attraction> = headings(doc)
        .into_iter()
        .filter(|h| is_attraction_heading(*h))
        .flat_map(|h| parse_section_attractions(section_anchor(h)))
        .collect();

    if found.is_empty() {
        found = scan_keyword_lists(doc);
    }

    let mut seen = HashSet::new();
    found.retain(|a| seen.insert(a.name.to_lowercase()));
    (!found.is_empty()).then_some(found)
}

fn parse_section_attractions(anchor: ElementRef<'_>) -> Vec<Attraction> {
    let mut out = Vec::new();
    let Some(bold) = selector("b") else {
        return out;
    };
    for el in anchor.next_siblings().filter_map(ElementRef::wrap) {
        if is_section_boundary(el) {
            break;
        }
        match el.value().name() {
            "ul" | "ol" => out.extend(parse_list_items(el)),
            "p" => {
                let text = element_text(el);
                if text.trim().chars().count() <= 50 {
                    continue;
                }
                let description = strip_citations(text.trim()).trim().to_string();
                for b in el.select(&bold) {
                    let name = element_text(b).trim().to_string();
                    if name.chars().count() > 3 && name != "edit" {
                        out.push(Attraction {
                            kind: guess_attraction_type(&name).to_string(),
                            name,
                            description: description.clone(),
                            image_url: String::new(),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Fallback when no attraction section exists: any list outside the reference sections
/// that mentions a landmark keyword and has more than one item.
fn scan_keyword_lists(doc: &Html) -> Vec<Attraction> {
    let Some(li) = selector("li") else {
        return Vec::new();
    };
    let mut current_section = String::new();
    let mut out = Vec::new();
    for el in doc.root_element().descendants().filter_map(ElementRef::wrap) {
        match el.value().name() {
            "h2" | "h3" => current_section = heading_title(el),
            "ul" | "ol" => {
                if NON_CONTENT_SECTIONS.contains(&current_section.as_str()) {
                    continue;
                }
                let text = element_text(el).to_lowercase();
                if ATTRACTION_KEYWORDS.iter().any(|k| text.contains(k)) && el.select(&li).count() > 1 {
                    out.extend(parse_list_items(el));
                }
            }
            _ => {}
        }
    }
    out
}

fn name_from_text(text: &str) -> String {
    if let Some(pos) = text.find(':').filter(|pos| *pos > 0) {
        return text[..pos].trim().to_string();
    }
    if let Some(pos) = text.find(" - ").filter(|pos| *pos > 0) {
        return text[..pos].trim().to_string();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= 5 {
        text.to_string()
    } else {
        words[..(words.len() / 3).clamp(3, 5)].join(" ")
    }
}

fn parse_list_items(list: ElementRef<'_>) -> Vec<Attraction> {
    let (Some(bold), Some(link), Some(img)) = (selector("b"), selector("a"), selector("img")) else {
        return Vec::new();
    };
    list.children()
        .filter_map(ElementRef::wrap)
        .filter(|child| child.value().name() == "li")
        .filter_map(|item| {
            let text = element_text(item).trim().to_string();
            let raw_name = item
                .select(&bold)
                .next()
                .or_else(|| item.select(&link).next())
                .map(|el| element_text(el).trim().to_string())
                .unwrap_or_else(|| name_from_text(&text));
            let name = strip_citations(&raw_name).trim().to_string();
            if name.chars().count() <= 3 {
                return None;
            }
            let description = strip_citations(&text.replacen(&name, "", 1))
                .trim()
                .trim_start_matches([':', '-', '–', '—', ' '])
                .trim()
                .to_string();
            let image_url = item
                .select(&img)
                .next()
                .and_then(|i| i.value().attr("src"))
                .map(absolute_url)
                .unwrap_or_default();
            Some(Attraction {
                kind: guess_attraction_type(&name).to_string(),
                name,
                description,
                image_url,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_markers_are_removed() {
        assert_eq!(strip_citations("Paris[1] is big.[23]"), "Paris is big.");
        assert_eq!(strip_citations("[a] stays [ 1]"), "[a] stays [ 1]");
    }

    #[test]
    fn attraction_types_follow_keyword_order() {
        assert_eq!(guess_attraction_type("Louvre Museum"), "museum");
        assert_eq!(guess_attraction_type("Palace of Versailles"), "palace");
        assert_eq!(guess_attraction_type("Notre-Dame Cathedral"), "religious");
        assert_eq!(guess_attraction_type("Eiffel Tower"), "building");
        assert_eq!(guess_attraction_type("Tower Bridge"), "building");
        assert_eq!(guess_attraction_type("Champs-Élysées"), "landmark");
    }

    #[test]
    fn name_heuristics_for_plain_list_items() {
        assert_eq!(name_from_text("Old Harbour: a working port"), "Old Harbour");
        assert_eq!(name_from_text("Grand Bazaar - covered market"), "Grand Bazaar");
        assert_eq!(name_from_text("City Hall"), "City Hall");
        assert_eq!(
            name_from_text("one two three four five six seven eight nine ten eleven twelve"),
            "one two three four"
        );
    }

    #[test]
    fn empty_page_defaults_everything() {
        let parsed = extract_destination("<html><body></body></html>", "Nowhere");
        assert_eq!(parsed.destination_name, "Nowhere");
        assert_eq!(parsed.defaulted_fields().len(), 10);
        assert!(parsed.attractions.value.is_empty());
    }

    #[test]
    fn fallback_lists_skip_reference_sections() {
        let html = r#"<html><body>
            <h2><span class="mw-headline" id="Culture">Culture</span></h2>
            <ul><li><a href="/a">Rodin Museum</a> sculpture</li><li><a href="/b">Luxembourg Garden</a> park</li></ul>
            <h2><span class="mw-headline" id="See_also">See also</span></h2>
            <ul><li><a href="/c">List of museums</a></li><li><a href="/d">Tower list</a></li></ul>
        </body></html>"#;
        let parsed = extract_destination(html, "Paris");
        let names: Vec<&str> = parsed.attractions.value.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Rodin Museum", "Luxembourg Garden"]);
        assert_eq!(parsed.attractions.value[1].kind, "park");
    }

    #[test]
    fn request_uses_underscored_title() {
        let adapter = WikipediaAdapter::new("https://en.wikipedia.org/wiki/");
        let req = adapter
            .request_for(&SourceItem::destination("Cape Town"))
            .expect("request");
        assert_eq!(req.url, "https://en.wikipedia.org/wiki/Cape_Town");
        assert!(req.query.is_empty());
    }
}
