//! Reconciles the availability and metadata record streams into one catalog.
//!
//! Records are grouped with a union-find: first on shared identifiers (TMDB
//! id, IMDb id, availability-source id), then on normalized name + year for
//! groups whose identifiers do not contradict each other. Each group becomes
//! one `Title`; its listings become deduplicated availability records.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::genre::GenreMapper;
use super::policy::{ConflictPolicy, FieldCategory};
use super::title::{normalize_imdb_id, normalize_platform, normalize_region, NameKey};
use crate::catalog::{
    AvailabilityRecord, MediaKind, RawCatalog, RawDetails, RawListing, ReferenceData, SourceKind,
    Title, TitleId, UnifiedCatalog,
};

/// Non-fatal disagreement between the two sources on one field of one title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictDetected {
    pub title_id: TitleId,
    pub field: FieldCategory,
    pub metadata_value: String,
    pub availability_value: String,
    pub chosen: SourceKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub listings_in: usize,
    pub details_in: usize,
    pub titles_out: usize,
    pub availability_out: usize,
    /// Records folded into a title that another record already produced.
    pub collapsed_records: usize,
    /// Listings dropped because a fresher one covered the same slot.
    pub duplicate_availability: usize,
    pub conflicts: Vec<ConflictDetected>,
}

#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub catalog: UnifiedCatalog,
    pub report: MergeReport,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Ident {
    Tmdb(MediaKind, i64),
    Imdb(String),
    Watchmode(i64),
}

#[derive(Clone, Copy)]
enum Record<'a> {
    Details(&'a RawDetails),
    Listing(&'a RawListing),
}

impl<'a> Record<'a> {
    fn idents(&self) -> Vec<Ident> {
        let mut out = Vec::with_capacity(3);
        match self {
            Record::Details(d) => {
                let id = d.metadata_id();
                out.push(Ident::Tmdb(id.kind, id.tmdb_id));
                if let Some(imdb) = normalize_imdb_id(d.imdb_id.as_deref()) {
                    out.push(Ident::Imdb(imdb));
                }
            }
            Record::Listing(l) => {
                if let Some(id) = l.metadata_id() {
                    out.push(Ident::Tmdb(id.kind, id.tmdb_id));
                }
                if let Some(imdb) = normalize_imdb_id(l.imdb_id.as_deref()) {
                    out.push(Ident::Imdb(imdb));
                }
                out.push(Ident::Watchmode(l.watchmode_id));
            }
        }
        out
    }

    fn name_key(&self) -> Option<NameKey> {
        match self {
            Record::Details(d) => {
                use chrono::Datelike;
                NameKey::new(&d.title, d.release_date.map(|date| date.year()))
            }
            Record::Listing(l) => NameKey::new(&l.title, l.year),
        }
    }

    /// Total order independent of input position.
    fn sort_key(&self) -> (u8, String) {
        match self {
            Record::Details(d) => (0, serde_json::to_string(d).unwrap_or_default()),
            Record::Listing(l) => (1, serde_json::to_string(l).unwrap_or_default()),
        }
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Joins two sets, keeping the smaller index as root so roots stay
    /// stable for a given canonical record order.
    fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.find(a), self.find(b));
        let (root, child) = if ra <= rb { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        root
    }
}

#[derive(Default, Clone)]
struct GroupIds {
    tmdb: BTreeSet<(MediaKind, i64)>,
    imdb: BTreeSet<String>,
}

impl GroupIds {
    fn absorb(&mut self, other: GroupIds) {
        self.tmdb.extend(other.tmdb);
        self.imdb.extend(other.imdb);
    }

    /// Two groups may only be joined by name when neither identifier scheme
    /// says they are different works.
    fn compatible(&self, other: &GroupIds) -> bool {
        let tmdb_clash =
            !self.tmdb.is_empty() && !other.tmdb.is_empty() && self.tmdb.is_disjoint(&other.tmdb);
        let imdb_clash =
            !self.imdb.is_empty() && !other.imdb.is_empty() && self.imdb.is_disjoint(&other.imdb);
        !tmdb_clash && !imdb_clash
    }
}

#[derive(Debug, Clone, Default)]
pub struct Merger {
    policy: ConflictPolicy,
    genres: GenreMapper,
}

impl Merger {
    pub fn new(policy: ConflictPolicy, genres: GenreMapper) -> Self {
        Self { policy, genres }
    }

    pub fn merge(&self, raw: &RawCatalog) -> MergeOutput {
        let mut keyed: Vec<((u8, String), Record<'_>)> = raw
            .details
            .iter()
            .map(Record::Details)
            .chain(raw.listings.iter().map(Record::Listing))
            .map(|r| (r.sort_key(), r))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let records: Vec<Record<'_>> = keyed.into_iter().map(|(_, r)| r).collect();

        let mut uf = UnionFind::new(records.len());
        let mut owners: HashMap<Ident, usize> = HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            for ident in record.idents() {
                match owners.get(&ident) {
                    Some(&owner) => {
                        uf.union(owner, idx);
                    }
                    None => {
                        owners.insert(ident, idx);
                    }
                }
            }
        }

        // Identifier sets per current root, used to veto name-based joins.
        let mut group_ids: HashMap<usize, GroupIds> = HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            let root = uf.find(idx);
            let entry = group_ids.entry(root).or_default();
            for ident in record.idents() {
                match ident {
                    Ident::Tmdb(kind, id) => {
                        entry.tmdb.insert((kind, id));
                    }
                    Ident::Imdb(id) => {
                        entry.imdb.insert(id);
                    }
                    Ident::Watchmode(_) => {}
                }
            }
        }

        let mut by_name: Vec<(NameKey, usize)> = records
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| r.name_key().map(|k| (k, idx)))
            .collect();
        by_name.sort();
        for bucket in by_name.chunk_by(|a, b| a.0 == b.0) {
            let anchor = bucket[0].1;
            for &(_, idx) in &bucket[1..] {
                let (ra, rb) = (uf.find(anchor), uf.find(idx));
                if ra == rb {
                    continue;
                }
                let a_ids = group_ids.get(&ra).cloned().unwrap_or_default();
                let b_ids = group_ids.get(&rb).cloned().unwrap_or_default();
                if !a_ids.compatible(&b_ids) {
                    debug!(
                        name = %bucket[0].0,
                        "name match vetoed by conflicting identifiers"
                    );
                    continue;
                }
                group_ids.remove(&ra);
                group_ids.remove(&rb);
                let root = uf.union(ra, rb);
                let mut merged = a_ids;
                merged.absorb(b_ids);
                group_ids.insert(root, merged);
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in 0..records.len() {
            groups.entry(uf.find(idx)).or_default().push(idx);
        }

        let mut report = MergeReport {
            listings_in: raw.listings.len(),
            details_in: raw.details.len(),
            ..MergeReport::default()
        };
        let mut catalog = UnifiedCatalog::default();

        for members in groups.values() {
            let group: Vec<Record<'_>> = members.iter().map(|&i| records[i]).collect();
            let title = self.build_title(&group, &raw.reference, &mut report.conflicts);
            report.collapsed_records += group.len().saturating_sub(1);

            let mut slots: BTreeMap<(String, String), AvailabilityRecord> = BTreeMap::new();
            for record in &group {
                let Record::Listing(listing) = record else {
                    continue;
                };
                let candidate = AvailabilityRecord {
                    title_id: title.id.clone(),
                    platform: normalize_platform(&listing.platform),
                    platform_id: Some(listing.platform_id),
                    region: normalize_region(&listing.region),
                    kind: listing.kind,
                    observed_at: listing.observed_at,
                };
                let slot = (candidate.platform.clone(), candidate.region.clone());
                match slots.get_mut(&slot) {
                    Some(current) => {
                        report.duplicate_availability += 1;
                        let fresher = (candidate.observed_at, candidate.kind.rank())
                            > (current.observed_at, current.kind.rank());
                        if fresher {
                            *current = candidate;
                        }
                    }
                    None => {
                        slots.insert(slot, candidate);
                    }
                }
            }

            catalog.availability.extend(slots.into_values());
            catalog.titles.insert(title.id.clone(), title);
        }
        catalog.sort_availability();

        report.titles_out = catalog.titles.len();
        report.availability_out = catalog.availability.len();
        info!(
            listings = report.listings_in,
            details = report.details_in,
            titles = report.titles_out,
            availability = report.availability_out,
            collapsed = report.collapsed_records,
            duplicates = report.duplicate_availability,
            conflicts = report.conflicts.len(),
            "catalog merged"
        );

        MergeOutput { catalog, report }
    }

    fn build_title(
        &self,
        group: &[Record<'_>],
        reference: &ReferenceData,
        conflicts: &mut Vec<ConflictDetected>,
    ) -> Title {
        let mut idents: BTreeSet<Ident> = BTreeSet::new();
        for record in group {
            idents.extend(record.idents());
        }
        let id = canonical_id(&idents);

        // Freshest record per side; the first in canonical order wins a tie.
        let mut details: Option<&RawDetails> = None;
        let mut listing: Option<&RawListing> = None;
        for record in group {
            match *record {
                Record::Details(d) => {
                    if details.map_or(true, |cur| d.observed_at > cur.observed_at) {
                        details = Some(d);
                    }
                }
                Record::Listing(l) => {
                    if listing.map_or(true, |cur| l.observed_at > cur.observed_at) {
                        listing = Some(l);
                    }
                }
            }
        }

        let name = self.resolve(
            &id,
            FieldCategory::Name,
            details.map(|d| d.title.trim().to_string()).filter(|s| !s.is_empty()),
            listing.map(|l| l.title.trim().to_string()).filter(|s| !s.is_empty()),
            conflicts,
        );
        let release_year = self.resolve(
            &id,
            FieldCategory::ReleaseYear,
            details.and_then(|d| {
                use chrono::Datelike;
                d.release_date.map(|date| date.year())
            }),
            listing.and_then(|l| l.year),
            conflicts,
        );
        let kind = self.resolve(
            &id,
            FieldCategory::MediaKind,
            details.map(|d| d.kind),
            listing.and_then(|l| l.media_kind),
            conflicts,
        );

        let genres: BTreeSet<String> = details
            .map(|d| d.genres.iter().filter_map(|g| self.genres.unify(g)).collect())
            .unwrap_or_default();
        let languages: BTreeSet<String> = details
            .and_then(|d| d.original_language.as_deref())
            .filter(|code| !code.trim().is_empty())
            .map(|code| reference.language_name(code))
            .into_iter()
            .collect();
        let countries: BTreeSet<String> = details
            .map(|d| {
                d.origin_countries
                    .iter()
                    .filter(|code| !code.trim().is_empty())
                    .map(|code| reference.country_name(code))
                    .collect()
            })
            .unwrap_or_default();

        let tmdb_id = details.map(|d| d.tmdb_id).or_else(|| {
            idents.iter().find_map(|i| match i {
                Ident::Tmdb(_, id) => Some(*id),
                _ => None,
            })
        });
        let imdb_id = details
            .and_then(|d| normalize_imdb_id(d.imdb_id.as_deref()))
            .or_else(|| {
                idents.iter().find_map(|i| match i {
                    Ident::Imdb(id) => Some(id.clone()),
                    _ => None,
                })
            });
        let watchmode_id = idents.iter().find_map(|i| match i {
            Ident::Watchmode(id) => Some(*id),
            _ => None,
        });

        Title {
            name: name.unwrap_or_else(|| id.to_string()),
            kind: kind.unwrap_or(MediaKind::Movie),
            release_year,
            genres,
            languages,
            countries,
            tmdb_id,
            imdb_id,
            watchmode_id,
            vote_average: details.and_then(|d| d.vote_average),
            vote_count: details.and_then(|d| d.vote_count),
            popularity: details.and_then(|d| d.popularity),
            runtime_minutes: details.and_then(|d| d.runtime_minutes),
            status: details.and_then(|d| d.status.clone()),
            id,
        }
    }

    fn resolve<T>(
        &self,
        id: &TitleId,
        field: FieldCategory,
        metadata: Option<T>,
        availability: Option<T>,
        conflicts: &mut Vec<ConflictDetected>,
    ) -> Option<T>
    where
        T: PartialEq + std::fmt::Display,
    {
        let shown = match (&metadata, &availability) {
            (Some(m), Some(a)) => Some((m.to_string(), a.to_string())),
            _ => None,
        };
        let (value, conflict) = self.policy.resolve(field, metadata, availability);
        if conflict {
            if let Some((metadata_value, availability_value)) = shown {
                let chosen = self.policy.authority(field);
                warn!(
                    title = %id,
                    field = field.as_str(),
                    metadata = %metadata_value,
                    availability = %availability_value,
                    chosen = ?chosen,
                    "source conflict"
                );
                conflicts.push(ConflictDetected {
                    title_id: id.clone(),
                    field,
                    metadata_value,
                    availability_value,
                    chosen,
                });
            }
        }
        value
    }
}

fn canonical_id(idents: &BTreeSet<Ident>) -> TitleId {
    // BTreeSet order is Tmdb < Imdb < Watchmode, then by value.
    let label = match idents.iter().next() {
        Some(Ident::Tmdb(kind, id)) => format!("tmdb:{}:{}", kind.tmdb_segment(), id),
        Some(Ident::Imdb(id)) => format!("imdb:{id}"),
        Some(Ident::Watchmode(id)) => format!("watchmode:{id}"),
        None => "unidentified".to_string(),
    };
    TitleId(label)
}
