#![forbid(unsafe_code)]

use statusha_store::{InMemoryCluster, PartitionSpec, TopologySpec};

fn temp_file(ext: &str, body: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir();
    let f = format!(
        "statusha-test-{}.{}",
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos(),
        ext
    );
    let p = dir.join(f);
    std::fs::write(&p, body).unwrap();
    p
}

const YAML: &str = r#"
members:
  - { id: 1, site_name: site1, rack_name: r-0, machine_id: 10, process_name: "4001" }
  - { id: 2, site_name: site1, rack_name: r-1, machine_id: 11, process_name: "4002" }
services:
  - name: orders
    partitions:
      - { primary: 1, backup: 2 }
      - { primary: 2 }
  - name: Management
    service_type: Management
"#;

#[test]
fn loads_yaml_with_defaults() {
    let p = temp_file("yaml", YAML);
    let spec = TopologySpec::load(&p).unwrap();
    assert_eq!(spec.members.len(), 2);
    assert_eq!(spec.members[0].rack_name.as_deref(), Some("r-0"));
    let orders = &spec.services[0];
    assert_eq!(orders.service_type, "DistributedCache");
    assert!(orders.placement_strategy);
    assert_eq!(orders.partitions.as_ref().unwrap()[1], PartitionSpec { primary: Some(2), backup: None });
    assert!(spec.services[1].partitions.is_none());
    let _ = std::fs::remove_file(p);
}

#[test]
fn loads_json_by_extension() {
    let body = r#"{"members":[{"id":1,"machine_id":1,"process_name":"1"}],"services":[{"name":"s","placement_strategy":false,"partitions":[{"primary":1}]}]}"#;
    let p = temp_file("json", body);
    let cluster = InMemoryCluster::from_path(&p).unwrap();
    let snap = cluster.current();
    assert_eq!(snap.member_count(), 1);
    assert!(!snap.services()[0].placement_strategy);
    assert_eq!(snap.member(1).unwrap().site_name, None);
    let _ = std::fs::remove_file(p);
}

#[test]
fn rejects_unknown_member_and_duplicates() {
    let bad = YAML.replace("{ primary: 2 }", "{ primary: 9 }");
    let p = temp_file("yml", &bad);
    let err = InMemoryCluster::from_path(&p).err().unwrap();
    assert!(err.to_string().contains("unknown member 9"));
    let _ = std::fs::remove_file(p);

    let dup = YAML.replace("id: 2,", "id: 1,");
    let p = temp_file("yml", &dup);
    let err = InMemoryCluster::from_path(&p).err().unwrap();
    assert!(err.to_string().contains("duplicate member id 1"));
    let _ = std::fs::remove_file(p);
}

#[test]
fn missing_file_names_path() {
    let err = TopologySpec::load(std::path::Path::new("/nonexistent/statusha.yaml")).unwrap_err();
    assert!(format!("{:#}", err).contains("/nonexistent/statusha.yaml"));
}
