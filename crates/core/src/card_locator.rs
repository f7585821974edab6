//! Card detection on an element snapshot.
//!
//! A card is a region of a composite page that is exported as its own image.
//! Detection is heuristic: selector tiers are tried from most specific to
//! most generic and the first tier that yields a usable region wins.
//! Everything here is pure and synchronous.

use crate::backend::{ElementInfo, Rect};
use crate::config::CardConfig;
use serde::{Deserialize, Serialize};

/// One way of recognising a card element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Matcher {
    /// Element carries this exact class token.
    Class { name: String },
    /// Some class token contains this substring.
    ClassContains { needle: String },
    /// Inline `style` contains this substring, optionally restricted to a tag.
    StyleContains { tag: Option<String>, needle: String },
    /// Attribute value contains this substring, optionally restricted to a tag.
    AttrContains {
        tag: Option<String>,
        attr: String,
        needle: String,
    },
    /// Any element with this tag.
    Tag { name: String },
}

impl Matcher {
    pub fn matches(&self, element: &ElementInfo) -> bool {
        match self {
            Matcher::Class { name } => element.classes().any(|c| c == name),
            Matcher::ClassContains { needle } => element.classes().any(|c| c.contains(needle.as_str())),
            Matcher::StyleContains { tag, needle } => {
                tag_matches(tag.as_deref(), element)
                    && element.attr("style").is_some_and(|s| s.contains(needle.as_str()))
            }
            Matcher::AttrContains { tag, attr, needle } => {
                tag_matches(tag.as_deref(), element)
                    && element.attr(attr).is_some_and(|v| v.contains(needle.as_str()))
            }
            Matcher::Tag { name } => element.tag.eq_ignore_ascii_case(name),
        }
    }
}

fn tag_matches(tag: Option<&str>, element: &ElementInfo) -> bool {
    tag.map_or(true, |t| element.tag.eq_ignore_ascii_case(t))
}

/// A named group of matchers. An element matches the tier if any matcher
/// accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorTier {
    pub name: String,
    pub matchers: Vec<Matcher>,
}

impl SelectorTier {
    pub fn new(name: impl Into<String>, matchers: Vec<Matcher>) -> Self {
        Self {
            name: name.into(),
            matchers,
        }
    }

    pub fn matches(&self, element: &ElementInfo) -> bool {
        self.matchers.iter().any(|m| m.matches(element))
    }

    /// The `card` class, then classes mentioning card, then explicitly
    /// sized blocks, then SVG pattern fills, then SVG groups.
    pub fn defaults() -> Vec<SelectorTier> {
        vec![
            SelectorTier::new(
                "card-class",
                vec![Matcher::Class {
                    name: "card".into(),
                }],
            ),
            SelectorTier::new(
                "card-like-class",
                vec![Matcher::ClassContains {
                    needle: "card".into(),
                }],
            ),
            SelectorTier::new(
                "sized-block",
                vec![
                    Matcher::StyleContains {
                        tag: Some("div".into()),
                        needle: "width".into(),
                    },
                    Matcher::StyleContains {
                        tag: Some("div".into()),
                        needle: "height".into(),
                    },
                ],
            ),
            SelectorTier::new(
                "svg-pattern",
                vec![Matcher::AttrContains {
                    tag: Some("rect".into()),
                    attr: "fill".into(),
                    needle: "url(".into(),
                }],
            ),
            SelectorTier::new("svg-group", vec![Matcher::Tag { name: "g".into() }]),
        ]
    }
}

/// A region to export.
#[derive(Debug, Clone, PartialEq)]
pub struct CardCandidate {
    /// 1-based position in document order.
    pub index: usize,
    pub rect: Rect,
    /// Outer markup of the element.
    pub markup: String,
    /// Name of the tier that produced it.
    pub tier: String,
}

/// Find the cards of a document.
///
/// `elements` must be in document order, with `parent` indices pointing
/// into the same slice. Within a tier, a match that contains two or more
/// other matches is a wrapper around cards and is dropped. Of the rest, a
/// match nested in another one is dropped unless `keep_nested` is set.
pub fn locate_cards(elements: &[ElementInfo], config: &CardConfig) -> Vec<CardCandidate> {
    for tier in &config.tiers {
        let matched: Vec<usize> = elements
            .iter()
            .enumerate()
            .filter(|(_, e)| tier.matches(e) && is_large_enough(&e.rect, config.min_card_size))
            .map(|(i, _)| i)
            .collect();

        if matched.is_empty() {
            continue;
        }

        let kept: Vec<usize> = if config.keep_nested {
            matched
        } else {
            let wrappers = wrappers(elements, &matched);
            let regions: Vec<usize> = matched
                .into_iter()
                .filter(|i| wrappers.binary_search(i).is_err())
                .collect();
            regions
                .iter()
                .copied()
                .filter(|&i| !ancestors(elements, i).any(|a| regions.binary_search(&a).is_ok()))
                .collect()
        };

        if kept.is_empty() {
            continue;
        }

        return kept
            .into_iter()
            .enumerate()
            .map(|(n, i)| CardCandidate {
                index: n + 1,
                rect: elements[i].rect,
                markup: elements[i].markup.clone(),
                tier: tier.name.clone(),
            })
            .collect();
    }

    Vec::new()
}

fn is_large_enough(rect: &Rect, min: f64) -> bool {
    rect.is_valid() && rect.width >= min && rect.height >= min
}

/// Ancestors of an element, nearest first. Stops on malformed parent links.
fn ancestors(elements: &[ElementInfo], index: usize) -> impl Iterator<Item = usize> + '_ {
    let mut current = elements.get(index).and_then(|e| e.parent);
    let mut hops = 0;
    std::iter::from_fn(move || {
        let parent = current?;
        if parent == index || parent >= elements.len() || hops > elements.len() {
            return None;
        }
        hops += 1;
        current = elements[parent].parent;
        Some(parent)
    })
}

/// Matches holding at least two other matches. `matched` is sorted.
fn wrappers(elements: &[ElementInfo], matched: &[usize]) -> Vec<usize> {
    let mut contained = vec![0usize; matched.len()];
    for &i in matched {
        for ancestor in ancestors(elements, i) {
            if let Ok(slot) = matched.binary_search(&ancestor) {
                contained[slot] += 1;
            }
        }
    }
    matched
        .iter()
        .zip(contained)
        .filter(|(_, count)| *count >= 2)
        .map(|(&i, _)| i)
        .collect()
}
