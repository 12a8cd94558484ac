use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{PlaceRecord, RankedMatch};
use crate::text::normalize;

/// Read-only record store. The relational backend is a collaborator; the core
/// only ever asks it for candidate rows.
#[async_trait]
pub trait PlaceStore: Send + Sync {
    async fn fetch_candidates(&self, filter: &CandidateFilter) -> anyhow::Result<Vec<PlaceRecord>>;
}

#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    /// Empty means all categories.
    pub categories: Vec<String>,
    pub limit: Option<usize>,
}

/// Ranks candidates against a query. Pure from the core's perspective.
pub trait Matcher: Send + Sync {
    fn score(&self, query: &str, candidates: &[PlaceRecord]) -> Vec<RankedMatch>;
}

impl<M: Matcher + ?Sized> Matcher for Box<M> {
    fn score(&self, query: &str, candidates: &[PlaceRecord]) -> Vec<RankedMatch> {
        (**self).score(query, candidates)
    }
}

/// Immutable view of the place dataset, rebuilt on TTL expiry rather than
/// mutated in place. Shared read-only by all concurrent requests.
pub struct DatasetSnapshot {
    pub records: Vec<PlaceRecord>,
    /// Normalized name/district/category terms used for keyword scanning.
    lexicon: Vec<LexiconTerm>,
    pub fetched_at: DateTime<Utc>,
}

struct LexiconTerm {
    display: String,
    normalized: String,
}

impl DatasetSnapshot {
    pub async fn load(store: &dyn PlaceStore) -> anyhow::Result<Self> {
        let records = store.fetch_candidates(&CandidateFilter::default()).await?;
        Ok(Self::from_records(records))
    }

    pub fn from_records(records: Vec<PlaceRecord>) -> Self {
        let mut seen = HashSet::new();
        let mut lexicon = Vec::new();
        for record in &records {
            let mut terms = vec![record.name.as_str(), record.category.as_str()];
            if let Some(thai) = &record.name_th {
                terms.push(thai);
            }
            if let Some(district) = &record.district {
                terms.push(district);
            }
            for term in terms {
                let normalized = normalize(term);
                if normalized.len() < 3 || !seen.insert(normalized.clone()) {
                    continue;
                }
                lexicon.push(LexiconTerm {
                    display: term.trim().to_string(),
                    normalized,
                });
            }
        }
        Self {
            records,
            lexicon,
            fetched_at: Utc::now(),
        }
    }

    /// Scans the query for known dataset terms. Substring match on the
    /// normalized forms, so Thai names (no word boundaries) work the same as
    /// English ones.
    pub fn scan_keywords(&self, query: &str, limit: usize) -> Vec<String> {
        let normalized_query = normalize(query);
        if normalized_query.is_empty() {
            return Vec::new();
        }
        let mut found = Vec::new();
        for term in &self.lexicon {
            if found.len() >= limit {
                break;
            }
            if normalized_query.contains(&term.normalized) {
                found.push(term.display.clone());
            }
        }
        found
    }
}

/// Token-overlap matcher. Cheap to score but the token table makes it the
/// kind of object worth building once and sharing.
pub struct KeywordMatcher {
    stopwords: HashSet<&'static str>,
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "in", "at", "to", "of", "for", "what", "where", "how", "any",
    "near", "me", "i", "want", "go", "visit", "ไป", "ที่", "อยาก", "เที่ยว", "มี", "ไหน", "อะไร",
];

impl KeywordMatcher {
    pub fn build() -> Self {
        Self {
            stopwords: STOPWORDS.iter().copied().collect(),
        }
    }

    fn query_tokens<'q>(&self, normalized_query: &'q str) -> Vec<&'q str> {
        normalized_query
            .split_whitespace()
            .filter(|token| token.len() >= 2 && !self.stopwords.contains(token))
            .collect()
    }
}

impl Matcher for KeywordMatcher {
    fn score(&self, query: &str, candidates: &[PlaceRecord]) -> Vec<RankedMatch> {
        let normalized_query = normalize(query);
        let tokens = self.query_tokens(&normalized_query);

        let mut ranked: Vec<RankedMatch> = candidates
            .iter()
            .filter_map(|record| {
                let name = normalize(&record.name);
                let name_th = record.name_th.as_deref().map(normalize);
                let category = normalize(&record.category);
                let description = normalize(&record.description);

                let mut score = 0.0;
                // Whole-name hit dominates token overlap.
                if !name.is_empty() && normalized_query.contains(&name) {
                    score += 5.0;
                }
                if let Some(thai) = &name_th {
                    if !thai.is_empty() && normalized_query.contains(thai) {
                        score += 5.0;
                    }
                }
                for token in &tokens {
                    if name.contains(token) {
                        score += 2.0;
                    }
                    if category.contains(token) {
                        score += 1.5;
                    }
                    if description.contains(token) {
                        score += 0.5;
                    }
                }
                (score > 0.0).then(|| RankedMatch {
                    record: record.clone(),
                    score,
                })
            })
            .collect();

        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}

/// In-memory store seeded with the Samut Songkhram dataset. Stands in for the
/// relational backend in the default wiring and in tests.
pub struct SeedPlaceStore {
    records: Vec<PlaceRecord>,
}

impl SeedPlaceStore {
    pub fn new(records: Vec<PlaceRecord>) -> Self {
        Self { records }
    }

    pub fn with_default_seed() -> Self {
        Self::new(default_seed())
    }
}

#[async_trait]
impl PlaceStore for SeedPlaceStore {
    async fn fetch_candidates(&self, filter: &CandidateFilter) -> anyhow::Result<Vec<PlaceRecord>> {
        let mut records: Vec<PlaceRecord> = self
            .records
            .iter()
            .filter(|record| {
                filter.categories.is_empty() || filter.categories.contains(&record.category)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

pub fn default_seed() -> Vec<PlaceRecord> {
    vec![
        PlaceRecord {
            id: 1,
            name: "Amphawa Floating Market".to_string(),
            name_th: Some("ตลาดน้ำอัมพวา".to_string()),
            category: "market".to_string(),
            district: Some("Amphawa".to_string()),
            description: "Evening floating market with boat noodles and firefly tours".to_string(),
        },
        PlaceRecord {
            id: 2,
            name: "Maeklong Railway Market".to_string(),
            name_th: Some("ตลาดร่มหุบ".to_string()),
            category: "market".to_string(),
            district: Some("Mueang".to_string()),
            description: "Umbrella-folding market straddling an active railway track".to_string(),
        },
        PlaceRecord {
            id: 3,
            name: "Wat Bang Kung".to_string(),
            name_th: Some("วัดบางกุ้ง".to_string()),
            category: "temple".to_string(),
            district: Some("Bang Khonthi".to_string()),
            description: "Ordination hall wrapped in banyan tree roots, old camp site".to_string(),
        },
        PlaceRecord {
            id: 4,
            name: "Wat Phet Samut Worawihan".to_string(),
            name_th: Some("วัดเพชรสมุทรวรวิหาร".to_string()),
            category: "temple".to_string(),
            district: Some("Mueang".to_string()),
            description: "Home of the revered Luang Pho Ban Laem Buddha image".to_string(),
        },
        PlaceRecord {
            id: 5,
            name: "Don Hoi Lot".to_string(),
            name_th: Some("ดอนหอยหลอด".to_string()),
            category: "nature".to_string(),
            district: Some("Mueang".to_string()),
            description: "Tidal flats at the Mae Klong river mouth, famous for razor clams".to_string(),
        },
        PlaceRecord {
            id: 6,
            name: "King Rama II Memorial Park".to_string(),
            name_th: Some("อุทยาน ร.2".to_string()),
            category: "attraction".to_string(),
            district: Some("Amphawa".to_string()),
            description: "Riverside park and museum honouring King Rama II".to_string(),
        },
        PlaceRecord {
            id: 7,
            name: "Tha Kha Floating Market".to_string(),
            name_th: Some("ตลาดน้ำท่าคา".to_string()),
            category: "market".to_string(),
            district: Some("Amphawa".to_string()),
            description: "Quiet canal-side morning market held on traditional lunar days".to_string(),
        },
        PlaceRecord {
            id: 8,
            name: "Ban Bang Phlap Community".to_string(),
            name_th: Some("ชุมชนบ้านบางพลับ".to_string()),
            category: "attraction".to_string(),
            district: Some("Bang Khonthi".to_string()),
            description: "Fruit orchard community with pomelo tasting and cycling routes".to_string(),
        },
    ]
}
