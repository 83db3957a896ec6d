// tests/loader_tests.rs

#[cfg(test)]
mod tests {
    use c4vm::host::{Host, HostFs};
    use c4vm::loader::{load, Image, ImageError, Patch, PatchKind};
    use c4vm::memory::{Width, Word};
    use c4vm::opcode::OpcodeTable;
    use c4vm::printf::Printf;
    use c4vm::vm::{Vm, VmConfig};

    fn code(names: &[&str]) -> Vec<i64> {
        let table = OpcodeTable::standard();
        names
            .iter()
            .map(|token| table.code_of(token).unwrap_or_else(|| token.parse().unwrap()))
            .collect()
    }

    fn vm<W: Word>() -> Vm<W> {
        Vm::new(OpcodeTable::standard(), VmConfig::default()).unwrap()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn test_memory_layout_after_load() {
        let mut image = Image::new(Width::W32, code(&["IMM", "0", "LEV"]));
        image.data = b"hi\0".to_vec();
        let mut vm = vm::<i32>();
        load(&mut vm, &image, &args(&["prog", "x"])).unwrap();

        // Code at 0, data right after it.
        assert_eq!(vm.memory().read_word(0).unwrap(), 1); // IMM
        let data_addr = 3 * 4;
        assert_eq!(vm.read_string(data_addr).unwrap(), b"hi");

        // argv: pointer array one word past the data, strings after it.
        let argv = vm.memory().align(data_addr + 3 + 4);
        let first = vm.memory().read_word(argv).unwrap();
        let second = vm.memory().read_word(argv + 4).unwrap();
        assert_eq!(first, argv + 8);
        assert_eq!(vm.read_string(first).unwrap(), b"prog");
        assert_eq!(vm.read_string(second).unwrap(), b"x");

        // Stack: t, argv, argc, then the PSH; EXIT trampoline t points at.
        let top = vm.heap_start();
        assert_eq!(vm.pc, 0);
        assert_eq!(vm.bp, top);
        assert_eq!(vm.sp, top - 5 * 4);
        let stack: Vec<i32> =
            (0..5).map(|i| vm.memory().read_word(vm.sp + i * 4).unwrap()).collect();
        assert_eq!(stack, vec![top - 8, argv, 2, 15, 60]);
    }

    #[test]
    fn test_entry_point_and_code_patch() {
        // 0 JSR <patched> | 2 PSH | 3 EXIT | 4 ENT 0 | 6 IMM 9 | 8 LEV | 9 main: JMP 0
        let mut image = Image::new(
            Width::W64,
            code(&["JSR", "0", "PSH", "EXIT", "ENT", "0", "IMM", "9", "LEV", "JMP", "0"]),
        );
        image.entry = 9;
        image.patches = vec![
            Patch { kind: PatchKind::Code, index: 1, value: 4 },
            Patch { kind: PatchKind::Code, index: 10, value: 0 },
        ];
        let mut vm = vm::<i64>();
        load(&mut vm, &image, &args(&["prog"])).unwrap();
        assert_eq!(vm.pc, 72);
        assert_eq!(vm.memory().read_word(8).unwrap(), 32);

        let mut fs = HostFs::new();
        let mut printf = Printf::new(Width::W64);
        let mut out = Vec::new();
        let mut host = Host::new(&mut fs, &mut printf, &mut out);
        assert_eq!(vm.run(&mut host).unwrap(), 9);
    }

    #[test]
    fn test_data_patch() {
        let mut image = Image::new(Width::W32, code(&["IMM", "5", "LEV"]));
        image.data = b"abcdefgh".to_vec();
        image.patches = vec![Patch { kind: PatchKind::Data, index: 1, value: 5 }];
        let mut vm = vm::<i32>();
        load(&mut vm, &image, &args(&["prog"])).unwrap();
        let addr = vm.memory().read_word(4).unwrap();
        assert_eq!(addr, 12 + 5);
        assert_eq!(vm.read_string(addr).unwrap(), b"fgh");
    }

    #[test]
    fn test_load_errors() {
        let image = Image::new(Width::W64, code(&["IMM", "0", "LEV"]));
        assert!(matches!(
            load(&mut vm::<i32>(), &image, &[]),
            Err(ImageError::WidthMismatch { image: Width::W64, vm: Width::W32 })
        ));

        let table = OpcodeTable::from_pairs([(0, "IMM"), (1, "PSH"), (2, "LEV")]).unwrap();
        let mut bare = Vm::<i64>::new(table, VmConfig::default()).unwrap();
        assert!(matches!(
            load(&mut bare, &image, &[]),
            Err(ImageError::MissingOpcode("EXIT"))
        ));

        let mut bad_patch = image.clone();
        bad_patch.patches.push(Patch { kind: PatchKind::Code, index: 3, value: 0 });
        assert!(matches!(
            load(&mut vm::<i64>(), &bad_patch, &[]),
            Err(ImageError::BadPatch { index: 3, len: 3 })
        ));

        let mut bad_entry = image.clone();
        bad_entry.entry = 3;
        assert!(matches!(
            load(&mut vm::<i64>(), &bad_entry, &[]),
            Err(ImageError::BadEntry { entry: 3, len: 3 })
        ));

        let config = VmConfig { pool_size: 64, ..VmConfig::default() };
        let mut small = Vm::<i64>::new(OpcodeTable::standard(), config).unwrap();
        let big = Image::new(Width::W64, vec![0; 16]);
        assert!(matches!(load(&mut small, &big, &[]), Err(ImageError::TooLarge { .. })));
    }

    #[test]
    fn test_image_codec() {
        let image = Image {
            width: Width::W64,
            entry: 2,
            code: vec![1, -5, 60, i64::MAX],
            data: b"data\0".to_vec(),
            patches: vec![
                Patch { kind: PatchKind::Code, index: 1, value: 3 },
                Patch { kind: PatchKind::Data, index: 3, value: -2 },
            ],
        };
        let mut bytes = Vec::new();
        image.write_to(&mut bytes).unwrap();
        assert_eq!(&bytes[..5], b"C4VM@");
        assert_eq!(Image::read_from(&mut bytes.as_slice()).unwrap(), image);
    }

    #[test]
    fn test_image_codec_errors() {
        let mut bytes = Vec::new();
        Image::new(Width::W32, vec![1, 2]).write_to(&mut bytes).unwrap();

        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = b'X';
        assert!(matches!(
            Image::read_from(&mut wrong_magic.as_slice()),
            Err(ImageError::BadMagic(_))
        ));

        let mut wrong_width = bytes.clone();
        wrong_width[4] = 16;
        assert!(matches!(
            Image::read_from(&mut wrong_width.as_slice()),
            Err(ImageError::UnsupportedWidth(16))
        ));

        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            Image::read_from(&mut &truncated[..]),
            Err(ImageError::Io(_))
        ));
    }
}
