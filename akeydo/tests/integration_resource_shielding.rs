//! End-to-end resource-shielding coverage: CPU cpuset partitioning and
//! huge-page allocation driven through the full `Orchestrator` `Prepare`/
//! `Release` cycle against a fake sysfs tree, rather than calling the
//! plug-ins' `Plugin` methods directly.

use std::time::Duration;

use akeydo::orchestrator::Orchestrator;
use akeydo::plugin::Plugin;
use akeydo::plugins::cpu::CpuShieldPlugin;
use akeydo::plugins::memory::HugePagesPlugin;

const HOST_CGROUPS: [&str; 3] = ["init.scope", "user.slice", "system.slice"];
const AMBIENT_TUNABLES: [&str; 3] = [
    "proc/sys/vm/stat_interval",
    "proc/sys/kernel/watchdog",
    "sys/bus/workqueue/devices/writeback/numa",
];

fn fake_root(total_cpus: u32) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for cgroup in HOST_CGROUPS {
        let path = dir.path().join(format!("sys/fs/cgroup/{cgroup}"));
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("cpuset.cpus"), "").unwrap();
    }
    std::fs::write(dir.path().join("sys/fs/cgroup/cgroup.subtree_control"), "").unwrap();
    for tunable in AMBIENT_TUNABLES {
        let full = dir.path().join(tunable);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, "0").unwrap();
    }

    let hugepages_dir = dir.path().join("sys/kernel/mm/hugepages/hugepages-1048576kB");
    std::fs::create_dir_all(&hugepages_dir).unwrap();
    std::fs::write(hugepages_dir.join("nr_hugepages"), "0").unwrap();
    let thp_dir = dir.path().join("sys/kernel/mm/transparent_hugepage");
    std::fs::create_dir_all(&thp_dir).unwrap();
    std::fs::write(thp_dir.join("enabled"), "always").unwrap();
    for path in ["proc/sys/vm/drop_caches", "proc/sys/vm/compact_memory"] {
        let full = dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, "0").unwrap();
    }

    let _ = total_cpus;
    dir
}

fn cpuset_of(dir: &std::path::Path, cgroup: &str) -> String {
    std::fs::read_to_string(dir.join(format!("sys/fs/cgroup/{cgroup}/cpuset.cpus"))).unwrap()
}

fn domain_with_cpus_and_hugepages(name: &str, cpuset: &str, gib: u64) -> String {
    format!(
        r#"<domain type='kvm'>
             <name>{name}</name>
             <memory unit='GiB'>{gib}</memory>
             <memoryBacking><hugepages/></memoryBacking>
             <cputune>
               <vcpupin vcpu='0' cpuset='{cpuset}'/>
             </cputune>
           </domain>"#
    )
}

#[test]
fn preparing_a_pinned_hugepage_guest_shields_cpus_and_allocates_pages() {
    let dir = fake_root(8);

    let orchestrator = Orchestrator::spawn(
        {
            let root = dir.path().to_path_buf();
            move |_handles| {
                let plugins: Vec<Box<dyn Plugin>> = vec![
                    Box::new(CpuShieldPlugin::new(root.clone(), 8)),
                    Box::new(HugePagesPlugin::new(root.clone(), Duration::from_millis(500))),
                ];
                plugins
            }
        },
        |_target| {},
    );

    assert!(orchestrator.prepare("win10", domain_with_cpus_and_hugepages("win10", "2-3", 4)));
    assert_eq!(cpuset_of(dir.path(), "init.scope"), "0,1,4,5,6,7");

    let nr_path = dir.path().join("sys/kernel/mm/hugepages/hugepages-1048576kB/nr_hugepages");
    assert_eq!(std::fs::read_to_string(&nr_path).unwrap(), "4");
    let thp_path = dir.path().join("sys/kernel/mm/transparent_hugepage/enabled");
    assert_eq!(std::fs::read_to_string(&thp_path).unwrap(), "never");

    assert!(orchestrator.release("win10", domain_with_cpus_and_hugepages("win10", "2-3", 4)));
    assert_eq!(cpuset_of(dir.path(), "init.scope"), "0,1,2,3,4,5,6,7");
    assert_eq!(std::fs::read_to_string(&nr_path).unwrap(), "0");
    assert_eq!(std::fs::read_to_string(&thp_path).unwrap(), "always");

    orchestrator.stop();
}

#[test]
fn two_overlapping_guests_keep_the_host_cpuset_shrunk_until_both_release() {
    let dir = fake_root(8);

    let orchestrator = Orchestrator::spawn(
        {
            let root = dir.path().to_path_buf();
            move |_handles| {
                let plugins: Vec<Box<dyn Plugin>> = vec![Box::new(CpuShieldPlugin::new(root.clone(), 8))];
                plugins
            }
        },
        |_target| {},
    );

    assert!(orchestrator.prepare("a", domain_with_cpus_and_hugepages("a", "1", 0)));
    assert!(orchestrator.prepare("b", domain_with_cpus_and_hugepages("b", "2-3", 0)));
    assert_eq!(cpuset_of(dir.path(), "user.slice"), "0,4,5,6,7");

    assert!(orchestrator.release("a", domain_with_cpus_and_hugepages("a", "1", 0)));
    assert_eq!(cpuset_of(dir.path(), "user.slice"), "0,1,4,5,6,7");

    assert!(orchestrator.release("b", domain_with_cpus_and_hugepages("b", "2-3", 0)));
    assert_eq!(cpuset_of(dir.path(), "user.slice"), "0,1,2,3,4,5,6,7");

    orchestrator.stop();
}
