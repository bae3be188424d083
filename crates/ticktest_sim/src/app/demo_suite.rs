use std::cell::RefCell;
use std::rc::Rc;

use ticktest::{Registrar, TestFile};

use super::world::{World, SMELT_TICKS};

pub(crate) type SharedWorld = Rc<RefCell<World>>;

/// Test files run by the sim, in load order.
pub(crate) fn demo_files(world: &SharedWorld) -> Vec<TestFile> {
    vec![
        furnace_file(Rc::clone(world)),
        reload_file(Rc::clone(world)),
        housekeeping_file(Rc::clone(world)),
    ]
}

fn furnace_file(world: SharedWorld) -> TestFile {
    TestFile::new("furnace", move |r: &Registrar| {
        let reset = Rc::clone(&world);
        r.before_each(move || reset.borrow_mut().reset());

        let idle = Rc::clone(&world);
        r.test("idle furnace makes nothing", move |_| {
            assert_eq!(idle.borrow().plates(), 0);
        });

        let single = Rc::clone(&world);
        r.test("smelts one plate per batch", move |cx| {
            single.borrow_mut().insert_ore(1);
            cx.start_async();
            let world = Rc::clone(&single);
            cx.after_ticks(u64::from(SMELT_TICKS), move |cx| {
                assert_eq!(world.borrow().plates(), 1);
                cx.done();
            });
        });

        let batches = Rc::clone(&world);
        r.test_each([1u32, 2, 3], "smelts %d ore", move |cx, &count| {
            batches.borrow_mut().insert_ore(count);
            cx.start_async();
            let world = Rc::clone(&batches);
            cx.after_ticks(u64::from(count * SMELT_TICKS), move |cx| {
                assert_eq!(world.borrow().plates(), count);
                cx.done();
            });
        });

        let (fill, check) = (Rc::clone(&world), Rc::clone(&world));
        r.test("plates pile up between parts", move |_| {
            fill.borrow_mut().insert_ore(2);
        })
        .after_ticks(u64::from(2 * SMELT_TICKS), move |_| {
            let world = check.borrow();
            assert_eq!((world.ore(), world.plates()), (0, 2));
        });

        let messy = Rc::clone(&world);
        r.test("cleans up after itself", move |cx| {
            messy.borrow_mut().insert_ore(5);
            let world = Rc::clone(&messy);
            cx.after_test(move || world.borrow_mut().reset());
        });
    })
}

fn reload_file(world: SharedWorld) -> TestFile {
    TestFile::new("reload", move |r: &Registrar| {
        r.describe("across a script reload", |r| {
            let (before, after) = (Rc::clone(&world), Rc::clone(&world));
            r.test("the furnace keeps its contents", move |_| {
                let mut world = before.borrow_mut();
                world.reset();
                world.insert_ore(1);
            })
            .after_script_reload(move |_| {
                let world = after.borrow();
                assert!(world.reloads() >= 1, "host did not reload");
                assert_eq!(world.ore() + world.plates(), 1);
            });
        });
    })
}

fn housekeeping_file(world: SharedWorld) -> TestFile {
    TestFile::new("housekeeping", move |r: &Registrar| {
        r.ticks_between_tests(2);
        r.todo("reports furnace power draw");
        r.tags(["no_rerun"]);
        let counted = Rc::clone(&world);
        r.test("counts exactly one reload", move |_| {
            assert_eq!(counted.borrow().reloads(), 1);
        });
        r.skip().test("needs a power grid", |_| ());
    })
}
