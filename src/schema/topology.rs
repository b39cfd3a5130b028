//! Foreign-key topology
//!
//! Orders tables parents-first so rows can be copied without violating
//! foreign keys.

use crate::schema::model::{SchemaObject, TableDefinition, TableRef};
use std::collections::{BTreeMap, BTreeSet};

/// Parents before children. Tables caught in a reference cycle are appended
/// in name order and reported in the returned warnings.
pub fn dependency_order(tables: &[TableDefinition]) -> (Vec<TableRef>, Vec<String>) {
    let known: BTreeMap<String, TableRef> = tables.iter().map(|t| (t.key(), t.table_ref())).collect();
    let (placed, cyclic) = peel(tables);

    let mut order: Vec<TableRef> = placed.iter().filter_map(|k| known.get(k).cloned()).collect();
    let mut warnings = Vec::new();
    if !cyclic.is_empty() {
        let keys: Vec<String> = cyclic.iter().cloned().collect();
        warnings.push(format!(
            "foreign-key cycle between {}; copying them in name order",
            keys.join(", ")
        ));
        order.extend(keys.iter().filter_map(|k| known.get(k).cloned()));
    }

    (order, warnings)
}

/// Tables that cannot be placed parents-first: members of a reference cycle
/// and anything referencing one
pub fn cyclic_tables(tables: &[TableDefinition]) -> BTreeSet<String> {
    peel(tables).1
}

/// Repeatedly take the tables whose in-set parents are all placed
fn peel(tables: &[TableDefinition]) -> (Vec<String>, BTreeSet<String>) {
    let known: BTreeSet<String> = tables.iter().map(|t| t.key()).collect();

    // key -> referenced keys that are part of this set
    let mut pending: BTreeMap<String, BTreeSet<String>> = tables
        .iter()
        .map(|t| {
            let parents = t
                .referenced_tables()
                .into_iter()
                .filter(|k| known.contains(k))
                .collect();
            (t.key(), parents)
        })
        .collect();

    let mut order = Vec::with_capacity(tables.len());
    let mut placed = BTreeSet::new();

    loop {
        let ready: Vec<String> = pending
            .iter()
            .filter(|(_, parents)| parents.iter().all(|p| placed.contains(p)))
            .map(|(k, _)| k.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        for key in ready {
            pending.remove(&key);
            placed.insert(key.clone());
            order.push(key);
        }
    }

    (order, pending.into_keys().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{ConstraintDefinition, ConstraintKind};
    use crate::testing::fixtures;

    fn fk(name: &str, target: &str) -> ConstraintDefinition {
        ConstraintDefinition {
            name: name.to_string(),
            kind: ConstraintKind::ForeignKey,
            columns: vec![format!("{}_id", target)],
            references: Some(TableRef::new("public", target)),
            definition: format!("FOREIGN KEY ({}_id) REFERENCES public.{}(id)", target, target),
        }
    }

    #[test]
    fn test_parents_first() {
        let tables = vec![fixtures::orders_table(), fixtures::customers_table()];
        let (order, warnings) = dependency_order(&tables);
        assert_eq!(order[0].name, "customers");
        assert_eq!(order[1].name, "orders");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_cycle_is_appended_with_warning() {
        let mut a = fixtures::customers_table();
        a.name = "a".to_string();
        a.constraints.push(fk("a_b_fkey", "b"));
        let mut b = fixtures::customers_table();
        b.name = "b".to_string();
        b.constraints.push(fk("b_a_fkey", "a"));

        let (order, warnings) = dependency_order(&[b, a, fixtures::customers_table()]);
        let names: Vec<&str> = order.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["customers", "a", "b"]);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_cyclic_tables_include_dependents_of_the_cycle() {
        let mut a = fixtures::customers_table();
        a.name = "a".to_string();
        a.constraints.push(fk("a_b_fkey", "b"));
        let mut b = fixtures::customers_table();
        b.name = "b".to_string();
        b.constraints.push(fk("b_a_fkey", "a"));
        let mut c = fixtures::customers_table();
        c.name = "c".to_string();
        c.constraints.push(fk("c_a_fkey", "a"));

        let cyclic = cyclic_tables(&[a, b, c, fixtures::customers_table(), fixtures::orders_table()]);
        let keys: Vec<&str> = cyclic.iter().map(String::as_str).collect();
        assert_eq!(keys, vec!["public.a", "public.b", "public.c"]);
    }

    #[test]
    fn test_self_reference_is_not_a_cycle() {
        let mut tree = fixtures::customers_table();
        tree.constraints.push(fk("parent_fkey", "customers"));
        let (order, warnings) = dependency_order(&[tree]);
        assert_eq!(order.len(), 1);
        assert!(warnings.is_empty());
    }
}
