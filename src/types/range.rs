//! バイトレンジ計算
//!
//! 閉区間のバイトレンジと固定長パートの対応を計算します。

/// 閉区間`[start, end]`を覆うパート番号のリストを返す
///
/// `start > end`の場合は空を返します。結果は昇順です。
pub fn parts_for(start: u64, end: u64, part_size: u64) -> Vec<u32> {
    if start > end || part_size == 0 {
        return Vec::new();
    }
    let first = (start / part_size) as u32;
    let last = (end / part_size) as u32;
    (first..=last).collect()
}

/// 指定パートの実サイズを返す
///
/// 末尾のパートだけが`part_size`より短くなり得ます。
/// 範囲外のパート番号には0を返します。
pub fn part_size_of(part: u32, object_size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    let whole_parts = (object_size / part_size) as u32;
    let remainder = object_size % part_size;
    if part > whole_parts {
        // パート番号は0始まりなので、端数パートがあっても
        // whole_partsを超える番号は存在しない
        0
    } else if part == whole_parts {
        // 端数パートのサイズ。割り切れた場合は0（そのパートは存在しない）
        remainder
    } else {
        part_size
    }
}

/// 指定パートが占めるバイト区間`[start, end]`を返す
///
/// 範囲外のパートには`None`を返します。
pub fn part_byte_range(part: u32, object_size: u64, part_size: u64) -> Option<(u64, u64)> {
    let size = part_size_of(part, object_size, part_size);
    if size == 0 {
        return None;
    }
    let start = part as u64 * part_size;
    Some((start, start + size - 1))
}

/// 閉区間をパート境界に揃えて拡張する
///
/// アップストリームへのRangeリクエストをパート境界に正規化し、
/// 取得した全パートを完全な形で永続化できるようにします。
/// 末尾は`object_size`でクランプされます。
pub fn align_to_parts(start: u64, end: u64, object_size: u64, part_size: u64) -> (u64, u64) {
    let aligned_start = (start / part_size) * part_size;
    let aligned_end = ((end / part_size) + 1) * part_size - 1;
    (aligned_start, aligned_end.min(object_size.saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_for_basic() {
        // 10バイトのオブジェクト、4バイトパート
        assert_eq!(parts_for(0, 9, 4), vec![0, 1, 2]);
        assert_eq!(parts_for(0, 3, 4), vec![0]);
        assert_eq!(parts_for(4, 7, 4), vec![1]);
        assert_eq!(parts_for(5, 8, 4), vec![1, 2]);
        assert_eq!(parts_for(3, 4, 4), vec![0, 1]);
    }

    #[test]
    fn test_parts_for_empty() {
        assert_eq!(parts_for(5, 4, 4), Vec::<u32>::new());
        assert_eq!(parts_for(1, 0, 4), Vec::<u32>::new());
        assert_eq!(parts_for(0, 9, 0), Vec::<u32>::new());
    }

    #[test]
    fn test_parts_for_matches_floor_division() {
        // parts_for(start, end, ps) == { start/ps .. end/ps }
        for ps in [1u64, 2, 3, 4, 7, 16] {
            for start in 0u64..40 {
                for end in start..40 {
                    let parts = parts_for(start, end, ps);
                    let expected: Vec<u32> =
                        ((start / ps) as u32..=(end / ps) as u32).collect();
                    assert_eq!(parts, expected, "start={} end={} ps={}", start, end, ps);
                }
            }
        }
    }

    #[test]
    fn test_part_size_of() {
        // 10バイト、4バイトパート: 4, 4, 2
        assert_eq!(part_size_of(0, 10, 4), 4);
        assert_eq!(part_size_of(1, 10, 4), 4);
        assert_eq!(part_size_of(2, 10, 4), 2);
        assert_eq!(part_size_of(3, 10, 4), 0);

        // 割り切れる場合: 8バイト、4バイトパート
        assert_eq!(part_size_of(0, 8, 4), 4);
        assert_eq!(part_size_of(1, 8, 4), 4);
        assert_eq!(part_size_of(2, 8, 4), 0);

        // 1パートに収まる場合
        assert_eq!(part_size_of(0, 3, 4), 3);
        assert_eq!(part_size_of(1, 3, 4), 0);
    }

    #[test]
    fn test_part_sizes_sum_to_object_size() {
        for ps in [1u64, 2, 3, 4, 8] {
            for size in 0u64..50 {
                let total: u64 = (0..20).map(|p| part_size_of(p, size, ps)).sum();
                assert_eq!(total, size, "size={} ps={}", size, ps);
            }
        }
    }

    #[test]
    fn test_part_byte_range() {
        assert_eq!(part_byte_range(0, 10, 4), Some((0, 3)));
        assert_eq!(part_byte_range(1, 10, 4), Some((4, 7)));
        assert_eq!(part_byte_range(2, 10, 4), Some((8, 9)));
        assert_eq!(part_byte_range(3, 10, 4), None);
    }

    #[test]
    fn test_align_to_parts() {
        // [5, 8] を4バイト境界に揃えると [4, 9]（10バイトのオブジェクト）
        assert_eq!(align_to_parts(5, 8, 10, 4), (4, 9));
        // 既に境界に揃っている場合は変わらない
        assert_eq!(align_to_parts(4, 7, 10, 4), (4, 7));
        // 末尾はオブジェクトサイズでクランプ
        assert_eq!(align_to_parts(8, 9, 10, 4), (8, 9));
    }
}
