// Copyright (C) 2025 The Weald Authors. This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

#[cfg(test)]
mod test {
    use std::fs::{self, File};
    use std::path::PathBuf;

    use weald_db::{
        CURRENT_DB_VERSION, DbContext, DbVersion, DbioWriter, DumpConfig, DumpReason, FlushType,
        LoadError, LoadedWorld, NoHooks, ObjectStore, Parents, PropVal, ValidateError, db_disk_size,
        db_flush, db_load, dump_database, read_db_file, write_db_file,
    };
    use weald_var::{NOTHING, Obj, Symbol, v_err, v_float, v_int, v_list, v_obj, v_str};

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join(name)
    }

    fn load_fixture(name: &str) -> LoadedWorld {
        let f = File::open(fixture(name)).unwrap();
        read_db_file(f).expect("fixture should load")
    }

    fn dump_to_string(world: &LoadedWorld) -> String {
        let mut out = Vec::new();
        {
            let mut w = DbioWriter::new(&mut out);
            write_db_file(&mut w, world, "DUMPING").expect("dump should succeed");
        }
        String::from_utf8(out).unwrap()
    }

    /// Read the minimal next-gen core and confirm its contents arrived.
    #[test]
    fn load_minimal() {
        let world = load_fixture("Minimal.db");
        assert_eq!(world.version, DbVersion::NextGen);
        assert_eq!(world.users, vec![Obj::mk_id(3)]);
        assert_eq!(world.store.len(), 4);

        let sysobj = world.store.find(Obj::mk_id(0)).expect("system object");
        assert_eq!(sysobj.name, Symbol::mk("System Object"));
        assert_eq!(sysobj.owner, Obj::mk_id(3));
        assert_eq!(sysobj.parents(), Parents::One(Obj::mk_id(1)));
        assert_eq!(sysobj.location_id(), NOTHING);
        assert_eq!(sysobj.verbdefs.len(), 1);
        let dlc = &sysobj.verbdefs[0];
        assert_eq!(dlc.name, Symbol::mk("do_login_command"));
        assert_eq!(dlc.perms, 173);
        assert_eq!(dlc.prep, -1);
        assert_eq!(
            dlc.program.as_ref().expect("programmed verb").source,
            "return #3;"
        );

        let root = world.store.find(Obj::mk_id(1)).expect("root class");
        assert_eq!(root.parents(), Parents::One(NOTHING));
        assert_eq!(
            root.children_ids(),
            vec![Obj::mk_id(0), Obj::mk_id(2), Obj::mk_id(3)]
        );

        let room = world.store.find(Obj::mk_id(2)).expect("first room");
        assert_eq!(room.contents_ids(), vec![Obj::mk_id(3)]);
        // eval is unprogrammed.
        assert!(room.verbdefs[0].program.is_none());

        let wizard = world.store.find(Obj::mk_id(3)).expect("wizard");
        assert_eq!(wizard.location_id(), Obj::mk_id(2));
    }

    /// Write the minimal core back out; the bytes must match the input.
    #[test]
    fn load_then_write() {
        let world = load_fixture("Minimal.db");
        let output = dump_to_string(&world);
        let input = fs::read_to_string(fixture("Minimal.db")).unwrap();
        similar_asserts::assert_eq!(&input, &output);
    }

    /// The same core in the legacy v4 encoding migrates on load, and a fresh
    /// dump of the migrated store is byte-identical to the next-gen form.
    #[test]
    fn load_legacy_then_write() {
        let world = load_fixture("LegacyMinimal.db");
        assert_eq!(world.version, DbVersion::BfbugFixed);
        let output = dump_to_string(&world);
        let nextgen = fs::read_to_string(fixture("Minimal.db")).unwrap();
        similar_asserts::assert_eq!(&nextgen, &output);
    }

    /// Migration turns the intrusive chains into lists and keeps scalar
    /// parent values scalar, sentinel included.
    #[test]
    fn legacy_migration_shapes() {
        let world = load_fixture("LegacyMinimal.db");
        let root = world.store.find(Obj::mk_id(1)).unwrap();
        assert_eq!(root.parents.as_object(), Some(NOTHING));
        assert!(root.parents.as_list().is_none());
        assert_eq!(
            root.children_ids(),
            vec![Obj::mk_id(0), Obj::mk_id(2), Obj::mk_id(3)]
        );
        let room = world.store.find(Obj::mk_id(2)).unwrap();
        assert_eq!(room.contents_ids(), vec![Obj::mk_id(3)]);
    }

    /// An empty database: load succeeds trivially and re-dumps byte-identical.
    #[test]
    fn empty_database_round_trip() {
        let input = "** LambdaMOO Database, Format Version 5 **\n0\n0\n0\n0\n\
                     0 clocks\n0 queued tasks\n0 suspended tasks\n0 active connections\n";
        let world = read_db_file(input.as_bytes()).unwrap();
        assert!(world.store.is_empty());
        assert!(world.users.is_empty());
        similar_asserts::assert_eq!(input, &dump_to_string(&world));
    }

    /// A headerless snapshot is prehistoric and reads through the v4 path.
    #[test]
    fn prehistory_is_v4() {
        let input = "1\n0\n0\n0\n\
                     #0\nThing\n\n0\n-1\n-1\n-1\n-1\n-1\n-1\n-1\n0\n0\n0\n\
                     0 clocks\n0 queued tasks\n0 suspended tasks\n0 active connections\n";
        let world = read_db_file(input.as_bytes()).unwrap();
        assert_eq!(world.version, DbVersion::Prehistory);
        assert_eq!(world.store.len(), 1);
        assert_eq!(
            world.store.find(Obj::mk_id(0)).unwrap().name,
            Symbol::mk("Thing")
        );
    }

    /// A version this build does not recognize aborts the load.
    #[test]
    fn unknown_version_rejected() {
        let input = "** LambdaMOO Database, Format Version 6 **\n0\n0\n0\n0\n";
        assert!(matches!(
            read_db_file(input.as_bytes()),
            Err(LoadError::UnknownVersion(6))
        ));
    }

    /// Object ids must be consecutive.
    #[test]
    fn out_of_order_object_rejected() {
        let input = "** LambdaMOO Database, Format Version 5 **\n1\n0\n0\n0\n\
                     #1\nThing\n0\n-1\n1\n-1\n4\n0\n1\n-1\n4\n0\n0\n0\n0\n";
        assert!(matches!(
            read_db_file(input.as_bytes()),
            Err(LoadError::BadObject(1))
        ));
    }

    /// Recycled slots hold their position through load, migration, and dump.
    #[test]
    fn recycled_slot_round_trip() {
        let input = "** LambdaMOO Database, Format Version 5 **\n3\n0\n0\n0\n\
                     #0\nFirst\n0\n-1\n1\n-1\n4\n0\n1\n-1\n4\n0\n0\n0\n0\n\
                     #1 recycled\n\
                     #2\nThird\n0\n-1\n1\n-1\n4\n0\n1\n-1\n4\n0\n0\n0\n0\n\
                     0 clocks\n0 queued tasks\n0 suspended tasks\n0 active connections\n";
        let world = read_db_file(input.as_bytes()).unwrap();
        assert_eq!(world.store.last_used_objid(), Obj::mk_id(2));
        assert!(!world.store.valid(Obj::mk_id(1)));
        let output = dump_to_string(&world);
        similar_asserts::assert_eq!(input, &output);
    }

    /// Same, but entering through the v4 reader and the migrator.
    #[test]
    fn recycled_slot_survives_migration() {
        let input = "** LambdaMOO Database, Format Version 4 **\n3\n0\n0\n0\n\
                     #0\nFirst\n\n0\n-1\n-1\n-1\n-1\n-1\n-1\n-1\n0\n0\n0\n\
                     #1 recycled\n\
                     #2\nThird\n\n0\n-1\n-1\n-1\n-1\n-1\n-1\n-1\n0\n0\n0\n\
                     0 clocks\n0 queued tasks\n0 suspended tasks\n0 active connections\n";
        let world = read_db_file(input.as_bytes()).unwrap();
        assert_eq!(world.store.last_used_objid(), Obj::mk_id(2));
        assert!(world.store.valid(Obj::mk_id(0)));
        assert!(!world.store.valid(Obj::mk_id(1)));
        assert!(world.store.valid(Obj::mk_id(2)));
        assert!(dump_to_string(&world).contains("#1 recycled\n"));
    }

    /// A dangling parent in a v4 snapshot is repaired, not fatal.
    #[test]
    fn v4_dangling_parent_repaired() {
        let input = "** LambdaMOO Database, Format Version 4 **\n1\n0\n0\n0\n\
                     #0\nOrphan\n\n0\n-1\n-1\n-1\n-1\n7\n-1\n-1\n0\n0\n0\n\
                     0 clocks\n0 queued tasks\n0 suspended tasks\n0 active connections\n";
        let world = read_db_file(input.as_bytes()).unwrap();
        let o = world.store.find(Obj::mk_id(0)).unwrap();
        assert_eq!(o.parents(), Parents::One(NOTHING));
    }

    /// A containment cycle aborts the load.
    #[test]
    fn containment_cycle_fatal() {
        let input = "** LambdaMOO Database, Format Version 5 **\n2\n0\n0\n0\n\
                     #0\nBox\n0\n-1\n1\n1\n4\n1\n1\n1\n1\n-1\n4\n0\n0\n0\n0\n\
                     #1\nBag\n0\n-1\n1\n0\n4\n1\n1\n0\n1\n-1\n4\n0\n0\n0\n0\n";
        assert!(matches!(
            read_db_file(input.as_bytes()),
            Err(LoadError::Hierarchy(ValidateError::Cycles))
        ));
    }

    /// Wrong-kind relationship fields are fatal in the next-gen form.
    #[test]
    fn structural_type_error_fatal() {
        let input = "** LambdaMOO Database, Format Version 5 **\n1\n0\n0\n0\n\
                     #0\nBad\n0\n-1\n1\n-1\n4\n0\n0\n7\n4\n0\n0\n0\n0\n";
        assert!(matches!(
            read_db_file(input.as_bytes()),
            Err(LoadError::Hierarchy(ValidateError::InvalidObjects))
        ));
    }

    /// Build a store with the full range of property values, dump it, load
    /// it back, and dump again: the two snapshots must match byte for byte.
    #[test]
    fn property_values_round_trip() {
        let mut store = ObjectStore::new();
        {
            let o0 = store.new_object();
            o0.name = Symbol::mk("generic thing");
            o0.children = v_list(&[v_obj(Obj::mk_id(1))]);
            o0.propdefs = vec![Symbol::mk("description"), Symbol::mk("weight")];
            o0.propvals = vec![
                PropVal {
                    value: v_str("a dusty thing"),
                    owner: Obj::mk_id(0),
                    perms: 5,
                    is_clear: false,
                },
                PropVal {
                    value: v_float(2.25),
                    owner: Obj::mk_id(0),
                    perms: 1,
                    is_clear: false,
                },
            ];
        }
        {
            let o1 = store.new_object();
            o1.name = Symbol::mk("thing instance");
            o1.parents = v_obj(Obj::mk_id(0));
            o1.propvals = vec![
                PropVal {
                    value: v_list(&[v_int(1), v_err(weald_var::Error::E_PERM), v_str("x")]),
                    owner: Obj::mk_id(1),
                    perms: 3,
                    is_clear: false,
                },
                PropVal {
                    value: weald_var::v_none(),
                    owner: Obj::mk_id(1),
                    perms: 1,
                    is_clear: true,
                },
            ];
        }
        let world = LoadedWorld {
            store,
            users: vec![Obj::mk_id(0)],
            version: CURRENT_DB_VERSION,
        };

        let first = dump_to_string(&world);
        let reloaded = read_db_file(first.as_bytes()).expect("own dump should load");
        let second = dump_to_string(&reloaded);
        similar_asserts::assert_eq!(&first, &second);

        let o1 = reloaded.store.find(Obj::mk_id(1)).unwrap();
        assert!(o1.propvals[1].is_clear);
        assert_eq!(o1.propvals[0].value.as_list().unwrap().len(), 3);
    }

    /// An unforked checkpoint writes the dump file, bumps the generation,
    /// and leaves no temporary behind.
    #[test]
    fn unforked_checkpoint_writes_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("world.db");
        let mut ctx = DbContext::new(dir.path().join("in.db"), out.clone());
        let world = LoadedWorld {
            store: ObjectStore::new(),
            users: vec![],
            version: CURRENT_DB_VERSION,
        };
        let config = DumpConfig {
            unforked_checkpoints: true,
        };

        dump_database(DumpReason::Checkpoint, &mut ctx, &world, &config, &mut NoHooks).unwrap();
        assert_eq!(ctx.dump_generation, 1);
        assert!(out.exists());
        assert!(!dir.path().join("world.db.#1#").exists());
        read_db_file(File::open(&out).unwrap()).expect("checkpoint should be loadable");

        dump_database(DumpReason::Checkpoint, &mut ctx, &world, &config, &mut NoHooks).unwrap();
        assert_eq!(ctx.dump_generation, 2);
        assert!(!dir.path().join("world.db.#2#").exists());
    }

    /// A panic dump goes to the fixed `.PANIC` path and never replaces the
    /// authoritative file.
    #[test]
    fn panic_dump_never_renames() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("world.db");
        let mut ctx = DbContext::new(dir.path().join("in.db"), out.clone());
        let world = LoadedWorld {
            store: ObjectStore::new(),
            users: vec![],
            version: CURRENT_DB_VERSION,
        };
        db_flush(
            FlushType::Panic,
            &mut ctx,
            &world,
            &DumpConfig::default(),
            &mut NoHooks,
        )
        .unwrap();
        assert!(dir.path().join("world.db.PANIC").exists());
        assert!(!out.exists());
        assert_eq!(ctx.dump_generation, 0);
    }

    /// A checkpoint whose serialization fails leaves the previous dump file
    /// untouched and removes its temporary.
    #[test]
    fn failed_checkpoint_preserves_previous_dump() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("world.db");
        fs::write(&out, "the previous snapshot").unwrap();

        // Propval count disagrees with the propdef chain, which the writer
        // refuses to serialize.
        let mut store = ObjectStore::new();
        store.new_object().propvals = vec![PropVal {
            value: v_int(1),
            owner: Obj::mk_id(0),
            perms: 0,
            is_clear: false,
        }];
        let world = LoadedWorld {
            store,
            users: vec![],
            version: CURRENT_DB_VERSION,
        };

        let mut ctx = DbContext::new(dir.path().join("in.db"), out.clone());
        let config = DumpConfig {
            unforked_checkpoints: true,
        };
        assert!(
            dump_database(DumpReason::Checkpoint, &mut ctx, &world, &config, &mut NoHooks).is_err()
        );
        assert_eq!(fs::read_to_string(&out).unwrap(), "the previous snapshot");
        assert!(!dir.path().join("world.db.#1#").exists());
    }

    /// The no-op flush kinds really are no-ops.
    #[test]
    fn rate_control_flushes_do_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("world.db");
        let mut ctx = DbContext::new(dir.path().join("in.db"), out.clone());
        let world = LoadedWorld {
            store: ObjectStore::new(),
            users: vec![],
            version: CURRENT_DB_VERSION,
        };
        for kind in [FlushType::IfFull, FlushType::OneSecond] {
            db_flush(kind, &mut ctx, &world, &DumpConfig::default(), &mut NoHooks).unwrap();
        }
        assert!(!out.exists());
        assert_eq!(ctx.dump_generation, 0);
    }

    /// Until a checkpoint succeeds the input file is the authoritative image;
    /// afterwards the dump file is.
    #[test]
    fn disk_size_prefers_dump_after_first_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.db");
        fs::write(&input, "tiny").unwrap();
        let mut ctx = DbContext::new(input, dir.path().join("world.db"));
        assert_eq!(db_disk_size(&ctx).unwrap(), 4);

        let world = LoadedWorld {
            store: ObjectStore::new(),
            users: vec![],
            version: CURRENT_DB_VERSION,
        };
        let config = DumpConfig {
            unforked_checkpoints: true,
        };
        dump_database(DumpReason::Checkpoint, &mut ctx, &world, &config, &mut NoHooks).unwrap();
        let dumped = db_disk_size(&ctx).unwrap();
        assert_eq!(dumped, fs::metadata(dir.path().join("world.db")).unwrap().len());
        assert_ne!(dumped, 4);
    }

    /// Full lifecycle through the persistence context: initialize, load,
    /// shut down with a final dump.
    #[test]
    fn context_load_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.db");
        fs::copy(fixture("Minimal.db"), &input).unwrap();
        let out = dir.path().join("world.db");

        let mut ctx = DbContext::new(input, out.clone());
        let world = db_load(&mut ctx).unwrap();
        assert_eq!(ctx.input_version, DbVersion::NextGen);

        weald_db::db_shutdown(&mut ctx, &world, &DumpConfig::default());
        let dumped = fs::read_to_string(&out).unwrap();
        let original = fs::read_to_string(fixture("Minimal.db")).unwrap();
        similar_asserts::assert_eq!(&original, &dumped);
    }

    /// Forked checkpoint: the parent returns immediately and the child's
    /// completed file appears under the dump name.
    // Forking under the threaded test harness is not generally safe, so this
    // is not run by default.
    #[test]
    #[ignore]
    fn forked_checkpoint_produces_dump() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("world.db");
        let mut ctx = DbContext::new(dir.path().join("in.db"), out.clone());
        let world = LoadedWorld {
            store: ObjectStore::new(),
            users: vec![],
            version: CURRENT_DB_VERSION,
        };
        dump_database(
            DumpReason::Checkpoint,
            &mut ctx,
            &world,
            &DumpConfig::default(),
            &mut NoHooks,
        )
        .unwrap();
        let mut status = 0;
        unsafe { libc::wait(&mut status) };
        assert!(out.exists());
    }
}
