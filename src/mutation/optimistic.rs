//! Speculative edits applied to one cached variant.

use chrono::{DateTime, Utc};

use crate::cache::{CacheEntry, Cacheable, QueryKey};

/// A write to apply to the cache before the server confirms it.
#[derive(Debug, Clone)]
pub enum Optimistic<E: Cacheable> {
  /// Prepend a new entity to every first-page variant whose filter matches
  Insert(E),
  /// Merge fields into the entity with this id wherever it is listed
  Patch { id: String, patch: E::Patch },
  /// Drop the entity with this id wherever it is listed
  Remove { id: String },
}

impl<E: Cacheable> Optimistic<E> {
  pub fn entity_id(&self) -> &str {
    match self {
      Self::Insert(entity) => entity.cache_key(),
      Self::Patch { id, .. } | Self::Remove { id } => id,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Self::Insert(_) => "insert",
      Self::Patch { .. } => "patch",
      Self::Remove { .. } => "remove",
    }
  }
}

/// Apply `op` to one cache entry. Returns whether the entry changed.
///
/// Entries that have not received data yet are left alone. Inserts only
/// land on page 1: the position of a new item on later pages depends on
/// server-side ordering. Page-1 inserts are prepended, which assumes the
/// server lists newest first; the next refetch restores the true order.
pub fn apply_to_entry<Q: QueryKey>(
  entry: &mut CacheEntry<Q>,
  op: &Optimistic<Q::Entity>,
  now: DateTime<Utc>,
) -> bool {
  if !entry.has_data() {
    return false;
  }

  match op {
    Optimistic::Insert(entity) => {
      if entry.signature.page() != 1
        || !entry.signature.matches(entity)
        || entry.position(entity.cache_key()).is_some()
      {
        return false;
      }
      entry.items.insert(0, entity.clone());
      entry.pagination = entry.pagination.map(|p| p.incremented());
      true
    }
    Optimistic::Patch { id, patch } => match entry.position(id) {
      Some(index) => {
        entry.items[index].apply_patch(patch, now);
        true
      }
      None => false,
    },
    Optimistic::Remove { id } => match entry.position(id) {
      Some(index) => {
        entry.items.remove(index);
        entry.pagination = entry.pagination.map(|p| p.decremented());
        true
      }
      None => false,
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::tests::{item, key, page_of, Item};
  use crate::cache::{PaginationMeta, QueryPage};
  use proptest::prelude::*;

  fn entry_with(tag: Option<&str>, page: u32, items: Vec<Item>, limit: u32, total: u64) -> CacheEntry<crate::cache::store::tests::Key> {
    let mut query_page = page_of(items, limit, total);
    query_page.pagination = Some(PaginationMeta::new(page, limit, total));
    CacheEntry::resolved(key(tag, page), query_page, Utc::now())
  }

  fn five_items() -> Vec<Item> {
    (0..5).map(|i| item(&format!("v{}", i), "x")).collect()
  }

  #[test]
  fn test_insert_on_first_page_updates_counts() {
    let mut entry = entry_with(None, 1, five_items(), 5, 12);
    assert_eq!(entry.pagination.map(|p| p.total_pages), Some(3));

    assert!(apply_to_entry(&mut entry, &Optimistic::Insert(item("new", "x")), Utc::now()));
    let meta = entry.pagination.unwrap();
    assert_eq!(meta.total, 13);
    assert_eq!(meta.total_pages, 3);
    assert_eq!(entry.items.len(), 6);
    assert_eq!(entry.items[0], item("new", "x"));
  }

  #[test]
  fn test_insert_skips_later_pages_and_mismatches() {
    let mut second_page = entry_with(None, 2, five_items(), 5, 12);
    let before = second_page.clone();
    assert!(!apply_to_entry(&mut second_page, &Optimistic::Insert(item("new", "x")), Utc::now()));
    assert_eq!(second_page, before);

    let mut filtered = entry_with(Some("y"), 1, vec![], 5, 0);
    assert!(!apply_to_entry(&mut filtered, &Optimistic::Insert(item("new", "x")), Utc::now()));
    assert!(filtered.items.is_empty());
  }

  #[test]
  fn test_insert_never_duplicates() {
    let mut entry = entry_with(None, 1, five_items(), 5, 5);
    assert!(!apply_to_entry(&mut entry, &Optimistic::Insert(item("v2", "x")), Utc::now()));
    assert_eq!(entry.items.len(), 5);
    assert_eq!(entry.pagination.unwrap().total, 5);
  }

  #[test]
  fn test_insert_without_pagination_only_prepends() {
    let mut entry = CacheEntry::resolved(key(None, 1), QueryPage::new(vec![item("a", "x")], None), Utc::now());
    assert!(apply_to_entry(&mut entry, &Optimistic::Insert(item("b", "x")), Utc::now()));
    assert_eq!(entry.items.len(), 2);
    assert!(entry.pagination.is_none());
  }

  #[test]
  fn test_entries_without_data_are_untouched() {
    let mut entry = CacheEntry::empty(key(None, 1));
    assert!(!apply_to_entry(&mut entry, &Optimistic::Insert(item("a", "x")), Utc::now()));
    assert!(entry.items.is_empty());
  }

  #[test]
  fn test_patch_merges_present_entity_only() {
    let mut entry = entry_with(None, 1, five_items(), 5, 5);
    let op = Optimistic::Patch {
      id: "v3".to_string(),
      patch: "y".to_string(),
    };
    assert!(apply_to_entry(&mut entry, &op, Utc::now()));
    assert_eq!(entry.items[3], item("v3", "y"));

    let missing = Optimistic::Patch {
      id: "zz".to_string(),
      patch: "y".to_string(),
    };
    let before = entry.clone();
    assert!(!apply_to_entry(&mut entry, &missing, Utc::now()));
    assert_eq!(entry, before);
  }

  #[test]
  fn test_remove_floors_total() {
    let mut entry = entry_with(None, 1, vec![item("a", "x")], 10, 0);
    assert!(apply_to_entry(&mut entry, &Optimistic::Remove { id: "a".into() }, Utc::now()));
    let meta = entry.pagination.unwrap();
    assert_eq!(meta.total, 0);
    assert_eq!(meta.total_pages, 1);
  }

  proptest! {
    #[test]
    fn insert_lands_iff_first_page_and_match(
      page in 1u32..4,
      filter_tag in prop::option::of(prop_oneof![Just("x"), Just("y")]),
      entity_tag in prop_oneof![Just("x"), Just("y")],
      limit in 1u32..20,
      extra in 0u64..50,
    ) {
      let listed = five_items();
      let total = listed.len() as u64 + extra;
      let mut entry = entry_with(filter_tag, page, listed, limit, total);
      let should_land = page == 1 && filter_tag.map_or(true, |t| t == entity_tag);

      let changed = apply_to_entry(&mut entry, &Optimistic::Insert(item("new", entity_tag)), Utc::now());
      prop_assert_eq!(changed, should_land);
      prop_assert_eq!(entry.position("new").is_some(), should_land);

      let meta = entry.pagination.unwrap();
      let expected_total = if should_land { total + 1 } else { total };
      prop_assert_eq!(meta.total, expected_total);
      prop_assert_eq!(meta.total_pages, crate::cache::total_pages(expected_total, limit));
    }

    #[test]
    fn removing_absent_id_is_noop(count in 0usize..10, limit in 1u32..20) {
      let items: Vec<Item> = (0..count).map(|i| item(&format!("v{}", i), "x")).collect();
      let mut entry = entry_with(None, 1, items, limit, count as u64);
      let before = entry.clone();
      let changed = apply_to_entry(&mut entry, &Optimistic::Remove { id: "absent".into() }, Utc::now());
      prop_assert!(!changed);
      prop_assert_eq!(entry, before);
    }
  }
}
