//! Several participants applying one shared acknowledgement stream.

use notebook_client::{
    Ack, Cell, CellLanguage, ClientConfig, DeleteCellAck, Failure, Intent, LockAck, LockState,
    NotebookState, Participant, ParticipantId,
};

const CELLS: &[&str] = &["a", "b", "c"];

/// Small deterministic generator so interleavings are reproducible.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self, bound: usize) -> usize {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 % bound as u64) as usize
    }
}

#[derive(Clone)]
enum Event {
    Lock(ParticipantId, String),
    Unlock(ParticipantId, String),
    LockFailed(ParticipantId),
    Left(ParticipantId),
}

fn participants(n: usize) -> Vec<NotebookState> {
    let config = ClientConfig::default();
    let cells: Vec<Cell> = CELLS
        .iter()
        .map(|id| Cell::with_id(*id, CellLanguage::Code))
        .collect();
    (0..n)
        .map(|i| {
            let id = ParticipantId::new(format!("p{}", i));
            let me = Participant::named(id, format!("p{}", i));
            NotebookState::from_cells(me, &config, cells.clone())
        })
        .collect()
}

fn apply(views: &mut [NotebookState], event: &Event) {
    for view in views.iter_mut() {
        match event {
            Event::Lock(origin, cell) => view.confirm_lock(Ack::new(
                origin.clone(),
                LockAck {
                    cell_id: cell.clone(),
                },
            )),
            Event::Unlock(origin, cell) => view.confirm_unlock(Ack::new(
                origin.clone(),
                LockAck {
                    cell_id: cell.clone(),
                },
            )),
            Event::LockFailed(origin) => view.fail(Failure {
                origin: origin.clone(),
                intent: Intent::Lock,
                reason: "Cell already locked".into(),
            }),
            Event::Left(origin) => {
                if *origin != view.me().id {
                    view.participant_left(origin);
                }
            }
        }
    }
}

fn assert_consistent(views: &[NotebookState]) {
    for cell in CELLS {
        let holders = views
            .iter()
            .filter(|v| v.lock_state(cell) == LockState::LockedByMe)
            .count();
        assert!(holders <= 1, "cell {} has {} holders", cell, holders);

        let first = views[0].locks().holder(cell);
        assert!(views.iter().all(|v| v.locks().holder(cell) == first));
    }
    for view in views {
        let held = CELLS
            .iter()
            .filter(|cell| view.lock_state(cell) == LockState::LockedByMe)
            .count();
        assert!(held <= 1);
    }
}

#[test]
fn test_random_interleavings_keep_mutual_exclusion() {
    for seed in 1..=50u64 {
        let mut rng = XorShift(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut views = participants(3);
        // Lock requests dispatched but not yet decided.
        let mut requested: Vec<(usize, String)> = Vec::new();

        for _ in 0..300 {
            let who = rng.next(views.len());
            let me = views[who].me().id.clone();
            let event = match rng.next(5) {
                0 | 1 => {
                    let cell = CELLS[rng.next(CELLS.len())];
                    if views[who].request_lock(cell).is_ok() {
                        requested.push((who, cell.to_string()));
                    }
                    continue;
                }
                2 => {
                    if requested.is_empty() {
                        continue;
                    }
                    let (who, cell) = requested.remove(rng.next(requested.len()));
                    let origin = views[who].me().id.clone();
                    // The authoritative layer grants a free cell to a
                    // participant holding nothing, and refuses otherwise.
                    let free = views[0].locks().holder(&cell).is_none();
                    if free && views[0].locks().held_by(&origin).is_none() {
                        Event::Lock(origin, cell)
                    } else {
                        Event::LockFailed(origin)
                    }
                }
                3 => match views[who].locks().held_by(&me).cloned() {
                    Some(cell) => {
                        if views[who].request_unlock(&cell).is_err() {
                            continue;
                        }
                        Event::Unlock(me, cell)
                    }
                    None => continue,
                },
                _ => {
                    // A conflicting ack for a held cell is ignored everywhere.
                    if views[who].locked_cell_id().is_some() {
                        continue;
                    }
                    let cell = CELLS[rng.next(CELLS.len())];
                    match views[0].locks().holder(cell) {
                        Some(holder) if *holder != me => Event::Lock(me, cell.to_string()),
                        _ => continue,
                    }
                }
            };
            apply(&mut views, &event);
            assert_consistent(&views);
        }
    }
}

#[test]
fn test_departure_frees_locks_for_everyone() {
    let mut views = participants(2);
    let p0 = views[0].me().id.clone();

    views[0].request_lock("a").unwrap();
    apply(&mut views, &Event::Lock(p0.clone(), "a".into()));
    assert_eq!(
        views[1].lock_state("a"),
        LockState::LockedByOther { holder: p0.clone() }
    );

    apply(&mut views, &Event::Left(p0));
    assert_eq!(views[1].lock_state("a"), LockState::Unlocked);
    views[1].request_lock("a").unwrap();
}

#[test]
fn test_delete_converges_for_all_participants() {
    let mut views = participants(3);
    let p1 = views[1].me().id.clone();

    views[1].request_lock("b").unwrap();
    apply(&mut views, &Event::Lock(p1.clone(), "b".into()));

    views[1].request_delete_cell("b").unwrap();
    for view in views.iter_mut() {
        view.confirm_delete_cell(Ack::new(
            p1.clone(),
            DeleteCellAck {
                cell_id: "b".into(),
            },
        ));
    }

    for view in &views {
        let ids: Vec<&str> = view.cells().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(view.locks().is_empty());
    }
    assert_eq!(views[1].locked_cell_id(), None);
    assert!(views[1].in_flight().is_idle());
}
