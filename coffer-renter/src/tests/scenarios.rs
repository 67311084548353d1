use std::{collections::HashMap, time::Duration};

use tokio::sync::broadcast::error::TryRecvError;

use super::{test_config, TestGroup, TEST_PIECE_SIZE};
use crate::{
    contract_set::{ContractEvent, ContractState},
    contractor::MaintainerRequest,
    error::{is_invalid_input, is_unrecoverable},
    redundancy::TrackerRequest,
    types::{ContractId, FileId},
};

const CHUNK: usize = TEST_PIECE_SIZE * 2;

fn revisions(group: &TestGroup) -> HashMap<ContractId, u64> {
    group
        .renter
        .list_contracts()
        .into_iter()
        .map(|c| (c.id, c.revision_number))
        .collect()
}

fn assert_hosts_agree(group: &TestGroup) {
    for c in group.renter.list_contracts() {
        if let Some(theirs) = group.hosts.revision(&c.host, &c.id) {
            assert_eq!(theirs.number, c.revision_number, "contract {}", c.id);
        }
    }
}

async fn wait_for_redundancy(group: &TestGroup, id: &FileId, want: f64) -> f64 {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let got = group.renter.file_info(id).await.expect("info").redundancy;
        if got >= want || tokio::time::Instant::now() > deadline {
            return got;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn upload_download_round_trip() {
    let group = TestGroup::new(4, 4).await.expect("group");
    assert_eq!(group.renter.list_contracts().len(), 4);

    let (path, contents) = group.write_file("a.bin", 1000).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 2, 2, &group.cancel)
        .await
        .expect("upload");

    let info = group.renter.file_info(&id).await.expect("info");
    assert_eq!(info.size, 1000);
    assert_eq!(info.redundancy, 2.0);
    assert_eq!(info.full_redundancy, 2.0);
    assert_eq!(info.chunk_health.len(), 1000usize.div_ceil(CHUNK));
    assert!(info.chunk_health.iter().all(|h| *h == 4));
    assert_eq!(info.local.as_deref(), Some(path.canonicalize().expect("canon").as_path()));

    let file = group.renter.remote_file(&id).expect("file");
    for chunk in file.chunks.iter() {
        assert_eq!(chunk.hosts().len(), 4);
    }

    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);

    for (from, to) in [(0u64, 1u64), (127, 129), (500, 1000), (999, 1000)] {
        let got = group
            .renter
            .stream_range(&id, from, to, &group.cancel)
            .await
            .expect("range");
        assert_eq!(got, contents[from as usize..to as usize], "[{}, {})", from, to);
    }
    for (from, to) in [(10u64, 10u64), (0, 1001)] {
        let err = group
            .renter
            .stream_range(&id, from, to, &group.cancel)
            .await
            .unwrap_err();
        assert!(is_invalid_input(&err));
    }

    let dest = group.dir.path().join("a.out");
    let written = group
        .renter
        .download_to_disk(&id, &dest, &group.cancel)
        .await
        .expect("download to disk");
    assert_eq!(written, 1000);
    assert_eq!(tokio::fs::read(&dest).await.expect("read"), contents);
    assert_hosts_agree(&group);
}

#[tokio::test]
async fn background_transfers_complete() {
    let group = TestGroup::new(3, 3).await.expect("group");
    let (path, contents) = group.write_file("bg.bin", 700).await.expect("write");
    let handle = group
        .renter
        .start_upload(&path, 1, 2, group.cancel.clone())
        .await
        .expect("start upload");
    let id = handle.file_id();
    handle.wait().await.expect("upload");

    let dest = group.dir.path().join("bg.out");
    let download = group
        .renter
        .start_download(&id, &dest, group.cancel.clone())
        .expect("start download");
    assert_eq!(download.wait().await.expect("download"), 700);
    assert_eq!(tokio::fs::read(&dest).await.expect("read"), contents);
}

#[tokio::test]
async fn rejects_bad_uploads() {
    let group = TestGroup::new(3, 3).await.expect("group");
    let (path, _) = group.write_file("empty.bin", 0).await.expect("write");
    let err = group
        .renter
        .upload_file(&path, 1, 1, &group.cancel)
        .await
        .unwrap_err();
    assert!(is_invalid_input(&err));

    let (path, _) = group.write_file("b.bin", 100).await.expect("write");
    let err = group
        .renter
        .upload_file(&path, 0, 1, &group.cancel)
        .await
        .unwrap_err();
    assert!(is_invalid_input(&err));

    group
        .renter
        .upload_file(&path, 1, 1, &group.cancel)
        .await
        .expect("upload");
    let err = group
        .renter
        .upload_file(&path, 1, 1, &group.cancel)
        .await
        .unwrap_err();
    assert!(is_invalid_input(&err));

    let missing = group.dir.path().join("missing.bin");
    let err = group
        .renter
        .upload_file(&missing, 1, 1, &group.cancel)
        .await
        .unwrap_err();
    assert!(is_invalid_input(&err));
}

#[tokio::test]
async fn rejects_zero_piece_size() {
    let config = crate::config::RenterConfig {
        piece_size: 0,
        ..test_config(2)
    };
    let err = TestGroup::with_config(2, config).await.err().expect("rejected");
    assert!(is_invalid_input(&err));
}

#[tokio::test]
async fn stream_cache_serves_repeated_reads() {
    let group = TestGroup::new(4, 4).await.expect("group");
    let (path, contents) = group.write_file("s.bin", 1000).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 2, 2, &group.cancel)
        .await
        .expect("upload");

    for _ in 0..5 {
        let got = group
            .renter
            .stream_range(&id, 10, 20, &group.cancel)
            .await
            .expect("range");
        assert_eq!(got, contents[10..20]);
    }
    let stats = group.renter.stream_cache_stats();
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.hits, 4);

    assert!(group.renter.set_stream_cache_size(4));
    assert_eq!(group.renter.stream_cache_size(), 4);
    assert!(!group.renter.set_stream_cache_size(0));
    assert_eq!(group.renter.stream_cache_size(), 4);

    group.renter.delete_file(&id).await.expect("delete");
    assert!(group.renter.files().await.is_empty());
    let err = group
        .renter
        .stream_range(&id, 10, 20, &group.cancel)
        .await
        .unwrap_err();
    assert!(is_invalid_input(&err));
}

#[tokio::test]
async fn bandwidth_limits_apply() {
    let group = TestGroup::new(2, 2).await.expect("group");
    assert_eq!(group.renter.bandwidth_limit(), (0, 0));
    group.renter.set_bandwidth_limit(4096, 2048);
    assert_eq!(group.renter.bandwidth_limit(), (4096, 2048));

    let (path, contents) = group.write_file("slow.bin", 512).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 1, 1, &group.cancel)
        .await
        .expect("upload");
    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);
}

#[tokio::test]
async fn interrupted_upload_keeps_revisions() {
    let config = crate::config::RenterConfig {
        max_upload_failures: 1000,
        ..test_config(4)
    };
    let group = TestGroup::with_config(4, config).await.expect("group");
    let before = revisions(&group);
    let (path, contents) = group.write_file("u.bin", 300).await.expect("write");

    for interrupt in [&group.interrupts.upload_before, &group.interrupts.upload_after] {
        interrupt.fail_always();
        assert!(group
            .renter
            .upload_file(&path, 2, 2, &group.cancel)
            .await
            .is_err());
        interrupt.disable();
        assert_eq!(revisions(&group), before);
        assert_hosts_agree(&group);

        let id = group
            .renter
            .find_file(&path.canonicalize().expect("canon").to_string_lossy())
            .expect("registered");
        group.renter.delete_file(&id).await.expect("delete");
    }

    let id = group
        .renter
        .upload_file(&path, 2, 2, &group.cancel)
        .await
        .expect("upload");
    assert_hosts_agree(&group);
    assert!(group
        .renter
        .list_contracts()
        .iter()
        .all(|c| c.good_for_upload));
    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);
}

#[tokio::test]
async fn interrupted_download_keeps_revisions() {
    let group = TestGroup::new(4, 4).await.expect("group");
    let (path, contents) = group.write_file("d.bin", 300).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 2, 2, &group.cancel)
        .await
        .expect("upload");
    let before = revisions(&group);

    for interrupt in [
        &group.interrupts.download_before,
        &group.interrupts.download_after,
    ] {
        interrupt.fail_always();
        let err = group
            .renter
            .download_to_buffer(&id, &group.cancel)
            .await
            .unwrap_err();
        assert!(is_unrecoverable(&err), "{}", err);
        interrupt.disable();
        assert_eq!(revisions(&group), before);
        assert_hosts_agree(&group);
    }

    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);
}

#[tokio::test]
async fn offline_host_is_replaced_once() {
    let group = TestGroup::new(5, 4).await.expect("group");
    let contracted = group.contract_hosts();
    assert_eq!(contracted.len(), 4);
    let offline = contracted[0];
    group.hosts.set_online(&offline, false);
    let mut events = group.renter.subscribe_events();

    let mut formed = vec![];
    let mut not_good = vec![];
    let mut replaced = vec![];
    for _ in 0..30 {
        group.advance(1).await.expect("advance");
        loop {
            match events.try_recv() {
                Ok(ContractEvent::Formed { id, host }) => formed.push((id, host)),
                Ok(ContractEvent::NotGoodForRenew { id }) => not_good.push(id),
                Ok(ContractEvent::Replaced { id, by }) => replaced.push((id, by)),
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("event stream: {}", e),
            }
        }
    }

    assert_eq!(not_good.len(), 1);
    assert_eq!(replaced.len(), 1);
    assert_eq!(formed.len(), 1);
    assert_eq!(replaced[0], (not_good[0], formed[0].0));
    assert!(!contracted.contains(&formed[0].1));

    let contracts = group.renter.list_contracts();
    assert!(contracts.iter().all(|c| c.host != offline));
    assert_eq!(contracts.iter().filter(|c| c.good_for_renew).count(), 4);
    assert!(contracts
        .iter()
        .all(|c| c.state == ContractState::Active && c.end_height > group.renter.height()));
}

#[tokio::test]
async fn single_copy_repair() {
    let group = TestGroup::new(2, 3).await.expect("group");
    assert_eq!(group.renter.list_contracts().len(), 2);
    let (path, contents) = group.write_file("r.bin", 500).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 1, 1, &group.cancel)
        .await
        .expect("upload");
    assert_eq!(group.renter.file_info(&id).await.expect("info").redundancy, 2.0);

    let gone = group.contract_hosts()[0];
    assert!(group.hosts.remove_host(&gone).await);
    assert_eq!(group.renter.file_info(&id).await.expect("info").redundancy, 1.0);
    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);

    group.add_host();
    let report = group
        .renter
        .maintain_contracts(&group.cancel)
        .await
        .expect("maintain");
    assert_eq!(report.formed.len(), 1);

    let report = group.renter.repair(&group.cancel).await.expect("repair");
    let chunks = 500usize.div_ceil(TEST_PIECE_SIZE);
    assert_eq!(report.local_repairs, chunks);
    assert_eq!(report.pieces_uploaded, chunks);
    assert_eq!(report.pieces_failed, 0);
    assert_eq!(group.renter.file_info(&id).await.expect("info").redundancy, 2.0);

    // Nothing left to do.
    let report = group.renter.repair(&group.cancel).await.expect("repair");
    assert!(!report.changed());
}

#[tokio::test]
async fn survives_losing_parity_hosts() {
    let group = TestGroup::new(6, 6).await.expect("group");
    let (path, contents) = group.write_file("p.bin", 1500).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 2, 3, &group.cancel)
        .await
        .expect("upload");
    assert_eq!(group.renter.file_info(&id).await.expect("info").redundancy, 2.5);

    for host in group.contract_hosts().into_iter().take(3) {
        assert!(group.hosts.remove_host(&host).await);
    }
    let info = group.renter.file_info(&id).await.expect("info");
    assert!(info.redundancy >= 1.0 && info.redundancy < 2.5, "{}", info.redundancy);
    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);
}

#[tokio::test]
async fn remote_repair_restores_target() {
    let group = TestGroup::new(4, 5).await.expect("group");
    let (path, contents) = group.write_file("m.bin", 300).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 2, 2, &group.cancel)
        .await
        .expect("upload");
    let chunks = 300usize.div_ceil(CHUNK);
    tokio::fs::write(&path, vec![0u8; 300]).await.expect("overwrite");

    let hosts = group.contract_hosts();
    assert!(group.hosts.remove_host(&hosts[0]).await);
    group.add_host();
    group
        .renter
        .maintain_contracts(&group.cancel)
        .await
        .expect("maintain");

    // One piece down is still within the threshold.
    let report = group.renter.repair(&group.cancel).await.expect("repair");
    assert_eq!(report.chunks_skipped, chunks);
    assert_eq!(report.pieces_uploaded, 0);

    assert!(group.hosts.remove_host(&hosts[1]).await);
    let report = group.renter.repair(&group.cancel).await.expect("repair");
    assert_eq!(report.local_repairs, 0);
    assert_eq!(report.remote_repairs, chunks);
    assert_eq!(report.pieces_uploaded, chunks);

    let info = group.renter.file_info(&id).await.expect("info");
    assert!(info.chunk_health.iter().all(|h| *h == 3));
    assert_eq!(info.redundancy, 1.5);
    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);
}

#[tokio::test]
async fn unrecoverable_chunks_are_reported() {
    let group = TestGroup::new(2, 2).await.expect("group");
    let (path, _) = group.write_file("lost.bin", 100).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 1, 1, &group.cancel)
        .await
        .expect("upload");
    tokio::fs::remove_file(&path).await.expect("remove");
    for host in group.contract_hosts() {
        group.hosts.remove_host(&host).await;
    }

    let report = group.renter.repair(&group.cancel).await.expect("repair");
    assert_eq!(report.chunks_unrecoverable, 100usize.div_ceil(TEST_PIECE_SIZE));
    let err = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .unwrap_err();
    assert!(is_unrecoverable(&err));
}

#[tokio::test]
async fn state_survives_reopen() {
    let group = TestGroup::new(3, 3).await.expect("group");
    let (path, contents) = group.write_file("keep.bin", 400).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 1, 2, &group.cancel)
        .await
        .expect("upload");
    let contracts = revisions(&group);
    let height = group.renter.height();

    assert!(contracts.values().all(|n| *n > 0));

    let group = group.reopen().await.expect("reopen");
    assert_eq!(group.renter.height(), height);
    assert_eq!(revisions(&group), contracts);
    assert_hosts_agree(&group);
    let files = group.renter.files().await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].id, id);
    assert_eq!(files[0].size, 400);
    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);

    // Revisions made by the first renter and this one both carry over.
    let (path, more) = group.write_file("more.bin", 300).await.expect("write");
    let more_id = group
        .renter
        .upload_file(&path, 1, 2, &group.cancel)
        .await
        .expect("upload after reopen");
    let contracts = revisions(&group);
    let group = group.reopen().await.expect("reopen");
    assert_eq!(revisions(&group), contracts);
    assert_hosts_agree(&group);
    for (id, want) in [(id, contents), (more_id, more)] {
        let got = group
            .renter
            .download_to_buffer(&id, &group.cancel)
            .await
            .expect("download");
        assert_eq!(got, want);
    }
}

#[tokio::test]
async fn background_loops_repair_after_host_loss() {
    let group = TestGroup::new(2, 3).await.expect("group");
    let (path, _) = group.write_file("loop.bin", 200).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 1, 1, &group.cancel)
        .await
        .expect("upload");
    let gone = group.contract_hosts()[0];
    group.hosts.remove_host(&gone).await;
    assert_eq!(group.renter.file_info(&id).await.expect("info").redundancy, 1.0);

    let mut background = group.renter.spawn_background(group.cancel.child_token());
    group.add_host();
    assert_eq!(wait_for_redundancy(&group, &id, 2.0).await, 2.0);

    let report = background
        .redundancy
        .call(TrackerRequest::RepairNow)
        .await
        .expect("repair now");
    assert_eq!(report.files_checked, 1);
    assert!(!report.changed());
    let report = background
        .contracts
        .call(MaintainerRequest::MaintainNow)
        .await
        .expect("maintain now");
    assert_eq!(report.height, group.renter.height());

    background.cancel();
    background
        .join()
        .await
        .expect("join")
        .expect("background loops");
}

#[tokio::test]
async fn download_after_renew() {
    let group = TestGroup::new(3, 3).await.expect("group");
    let (path, contents) = group.write_file("renew.bin", 500).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 1, 2, &group.cancel)
        .await
        .expect("upload");
    let before: HashMap<ContractId, u64> = group
        .renter
        .list_contracts()
        .into_iter()
        .map(|c| (c.id, c.end_height))
        .collect();

    let mut events = group.renter.subscribe_events();
    group.advance(12).await.expect("advance");
    let mut renewed = 0;
    while let Ok(event) = events.try_recv() {
        if let ContractEvent::Renewed { .. } = event {
            renewed += 1;
        }
    }
    assert_eq!(renewed, 3);
    for c in group.renter.list_contracts() {
        assert_eq!(c.end_height, before[&c.id] + group.config.allowance.period);
    }
    assert_hosts_agree(&group);

    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);
}

#[tokio::test]
async fn uploads_resume_after_transient_outage() {
    let config = crate::config::RenterConfig {
        max_upload_failures: 1,
        ..test_config(3)
    };
    let group = TestGroup::with_config(3, config).await.expect("group");
    let (path, _) = group.write_file("outage.bin", 200).await.expect("write");

    group.interrupts.upload_before.fail_always();
    assert!(group
        .renter
        .upload_file(&path, 1, 2, &group.cancel)
        .await
        .is_err());
    group.interrupts.upload_before.disable();
    let id = group
        .renter
        .find_file(&path.canonicalize().expect("canon").to_string_lossy())
        .expect("registered");
    group.renter.delete_file(&id).await.expect("delete");
    assert!(group
        .renter
        .list_contracts()
        .iter()
        .all(|c| c.good_for_renew && !c.good_for_upload));

    group.advance(1).await.expect("advance");
    assert!(group
        .renter
        .list_contracts()
        .iter()
        .all(|c| c.good_for_upload));
    let (path, contents) = group.write_file("after.bin", 200).await.expect("write");
    let id = group
        .renter
        .upload_file(&path, 1, 2, &group.cancel)
        .await
        .expect("upload");
    let downloaded = group
        .renter
        .download_to_buffer(&id, &group.cancel)
        .await
        .expect("download");
    assert_eq!(downloaded, contents);
}
