use std::collections::BTreeMap;

use common::{AttrMap, KeySpec, Record, TaxonomyNode, UNGROUPED};

// Fields that describe one file rather than the group it sits in.
const PER_ITEM_ATTRS: [&str; 3] = ["title", "track", "disc"];

pub fn build(records: &[&Record], key_specs: &[KeySpec]) -> BTreeMap<String, TaxonomyNode> {
    let (spec, rest) = match key_specs.split_first() {
        Some(split) => split,
        None => return BTreeMap::new(),
    };

    let mut buckets: BTreeMap<String, Vec<&Record>> = BTreeMap::new();
    for record in records.iter().copied() {
        let value = group_value_for(record, spec);
        buckets.entry(value).or_default().push(record);
    }

    let mut out = BTreeMap::new();
    for (value, members) in buckets {
        let ungrouped = value == UNGROUPED;
        let node = if rest.is_empty() {
            make_leaf(spec, value.clone(), ungrouped, &members)
        } else {
            TaxonomyNode::Branch {
                key_spec: spec.clone(),
                group_value: value.clone(),
                ungrouped,
                children: build(&members, rest),
            }
        };
        out.insert(value, node);
    }
    out
}

pub fn derive<F>(
    groups: &BTreeMap<String, TaxonomyNode>,
    keep: F,
) -> BTreeMap<String, TaxonomyNode>
where
    F: Fn(&Record) -> bool,
{
    derive_children(groups, &keep)
}

fn derive_children<F>(
    children: &BTreeMap<String, TaxonomyNode>,
    keep: &F,
) -> BTreeMap<String, TaxonomyNode>
where
    F: Fn(&Record) -> bool,
{
    let mut out = BTreeMap::new();
    for (value, node) in children {
        if let Some(copy) = derive_node(node, keep) {
            out.insert(value.clone(), copy);
        }
    }
    out
}

fn derive_node<F>(node: &TaxonomyNode, keep: &F) -> Option<TaxonomyNode>
where
    F: Fn(&Record) -> bool,
{
    match node {
        TaxonomyNode::Branch {
            key_spec,
            group_value,
            ungrouped,
            children,
        } => {
            let kept = derive_children(children, keep);
            if kept.is_empty() {
                return None;
            }
            Some(TaxonomyNode::Branch {
                key_spec: key_spec.clone(),
                group_value: group_value.clone(),
                ungrouped: *ungrouped,
                children: kept,
            })
        }
        TaxonomyNode::Leaf {
            key_spec,
            group_value,
            ungrouped,
            members,
            representative,
        } => {
            let kept: Vec<Record> = members
                .iter()
                .filter(|member| keep(member))
                .cloned()
                .collect();
            if kept.is_empty() {
                return None;
            }
            Some(TaxonomyNode::Leaf {
                key_spec: key_spec.clone(),
                group_value: group_value.clone(),
                ungrouped: *ungrouped,
                members: kept,
                representative: representative.clone(),
            })
        }
    }
}

fn group_value_for(record: &Record, spec: &[String]) -> String {
    for name in spec {
        if let Some(value) = record.attr(name).and_then(|attr| attr.group_value()) {
            return value;
        }
    }
    UNGROUPED.to_string()
}

fn make_leaf(
    spec: &KeySpec,
    group_value: String,
    ungrouped: bool,
    members: &[&Record],
) -> TaxonomyNode {
    let mut ordered: Vec<Record> = members.iter().map(|record| (*record).clone()).collect();
    ordered.sort_by(|a, b| {
        member_index(a, "disc")
            .cmp(&member_index(b, "disc"))
            .then_with(|| member_index(a, "track").cmp(&member_index(b, "track")))
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| member_title(a).cmp(&member_title(b)))
    });
    let representative = ordered
        .first()
        .map(|record| representative_attrs(&record.attributes))
        .unwrap_or_default();
    TaxonomyNode::Leaf {
        key_spec: spec.clone(),
        group_value,
        ungrouped,
        members: ordered,
        representative,
    }
}

fn member_index(record: &Record, name: &str) -> i64 {
    record
        .attr(name)
        .and_then(|value| value.index_value())
        .unwrap_or(i64::MAX)
}

fn member_title(record: &Record) -> String {
    record
        .attr("title")
        .and_then(|value| value.group_value())
        .map(|title| title.to_lowercase())
        .unwrap_or_default()
}

fn representative_attrs(attributes: &AttrMap) -> AttrMap {
    let mut out = attributes.clone();
    for name in PER_ITEM_ATTRS {
        out.remove(name);
    }
    out
}
