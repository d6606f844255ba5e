use skp_api_types::RetentionPolicy;
use skp_datastore::prune::{compute_prune_info, PruneMark};
use skp_datastore::Snapshot;

fn create_info(snapshot_id: &str, created_at: i64) -> Snapshot {
    Snapshot {
        snapshot_id: snapshot_id.to_string(),
        name: String::from("host"),
        description: None,
        created_at,
        parent_id: None,
        source_root: String::from("/data"),
        chunk_size: 65536,
        total_files: 0,
        total_size: 0,
        snapshot_root: None,
        finished: true,
    }
}

fn get_prune_list(
    list: Vec<Snapshot>,
    return_kept: bool,
    policies: &[RetentionPolicy],
    now: i64,
) -> Vec<String> {
    let mut prune_info = compute_prune_info(list, policies, now);

    prune_info.reverse();

    prune_info
        .iter()
        .filter_map(|(info, mark)| {
            if mark.keep() != return_kept {
                None
            } else {
                Some(info.snapshot_id.clone())
            }
        })
        .collect()
}

#[test]
fn test_prune_keep_last() {
    let mut orig_list = Vec::new();

    orig_list.push(create_info("0001", 3600));
    orig_list.push(create_info("0002", 7200));
    orig_list.push(create_info("0003", 10800));
    orig_list.push(create_info("0004", 14400));
    orig_list.push(create_info("0005", 18000));

    let list = orig_list.clone();
    let policies = [RetentionPolicy::keep_last(2)];
    let remove_list = get_prune_list(list, false, &policies, 20000);
    let expect = vec![
        String::from("0001"),
        String::from("0002"),
        String::from("0003"),
    ];
    assert_eq!(remove_list, expect);

    let list = orig_list;
    let policies = [RetentionPolicy::keep_last(10)];
    let remove_list = get_prune_list(list, false, &policies, 20000);
    assert!(remove_list.is_empty());
}

#[test]
fn test_prune_older_than() {
    let mut orig_list = Vec::new();

    orig_list.push(create_info("0001", 1000));
    orig_list.push(create_info("0002", 5000));
    orig_list.push(create_info("0003", 9000));

    let list = orig_list.clone();
    let policies = [RetentionPolicy::older_than_seconds(2000)];
    let keep_list = get_prune_list(list, true, &policies, 10000);
    let expect = vec![String::from("0003")];
    assert_eq!(keep_list, expect);

    // everything younger than a day stays
    let list = orig_list;
    let policies = [RetentionPolicy::older_than_days(1)];
    let remove_list = get_prune_list(list, false, &policies, 10000);
    assert!(remove_list.is_empty());
}

#[test]
fn test_prune_union_of_policies() {
    let mut orig_list = Vec::new();

    orig_list.push(create_info("0001", 1000));
    orig_list.push(create_info("0002", 2000));
    orig_list.push(create_info("0003", 8000));
    orig_list.push(create_info("0004", 9000));

    // keep-last 1 keeps 0004, the age policy keeps 0003 and 0004
    let policies = [
        RetentionPolicy::keep_last(1),
        RetentionPolicy::older_than_seconds(3000),
    ];
    let remove_list = get_prune_list(orig_list.clone(), false, &policies, 10000);
    let expect = vec![String::from("0001"), String::from("0002")];
    assert_eq!(remove_list, expect);

    let keep_list = get_prune_list(orig_list, true, &policies, 10000);
    let expect = vec![String::from("0003"), String::from("0004")];
    assert_eq!(keep_list, expect);
}

#[test]
fn test_prune_ties_break_on_snapshot_id() {
    let mut orig_list = Vec::new();

    // same second, the monotonic id decides
    orig_list.push(create_info("000a", 5000));
    orig_list.push(create_info("000b", 5000));
    orig_list.push(create_info("000c", 5000));

    let policies = [RetentionPolicy::keep_last(1)];
    let keep_list = get_prune_list(orig_list, true, &policies, 6000);
    assert_eq!(keep_list, vec![String::from("000c")]);
}

#[test]
fn test_prune_marks_display() {
    assert_eq!(PruneMark::Keep.to_string(), "keep");
    assert_eq!(PruneMark::Remove.to_string(), "remove");
    assert!(PruneMark::Keep.keep());
    assert!(!PruneMark::Remove.keep());
}
